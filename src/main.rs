use forge::prelude::*;

mod functions;
mod schema;
mod services;

#[cfg(test)]
mod testing;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let pipeline = services::PipelineConfig::from_env();
    tracing::info!(
        retention_secs = pipeline.retention_secs,
        free_role = %pipeline.free_role,
        failure_policy = ?pipeline.failure_policy,
        "pipeline configured"
    );

    let config = ForgeConfig::from_file("forge.toml")?;
    let mut builder = Forge::builder();

    let fns = builder.function_registry_mut();
    fns.register_query::<functions::GetJobQuery>();
    fns.register_query::<functions::ListUserJobsQuery>();
    fns.register_mutation::<functions::RequestArchiveMutation>();
    fns.register_mutation::<functions::RequestRestoreMutation>();

    let daemons = builder.daemon_registry_mut();
    daemons.register::<functions::RequestsDaemon>();
    daemons.register::<functions::NotifierDaemon>();
    daemons.register::<functions::ArchiverDaemon>();
    daemons.register::<functions::RestorerDaemon>();

    builder.config(config).build()?.run().await
}
