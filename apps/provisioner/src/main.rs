use dotenvy::dotenv;
use std::env;
use tenancy_core::config::load_target_seeds;
use tenancy_core::{NewTenant, TenancyConfig, TenancyContext, TenantIdentifier};
use tracing::{Level, error, info, warn};
use tracing_subscriber::FmtSubscriber;

// Define a generic error type for the main function
type BoxError = Box<dyn std::error::Error + Send + Sync>;

const ENV_ALLOCATE_CODE: &str = "TENANCY_ALLOCATE_CODE";
const ENV_ALLOCATE_NAME: &str = "TENANCY_ALLOCATE_NAME";

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    // Load environment variables from .env file
    dotenv().ok();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env()) // Allow RUST_LOG
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting Provisioner v{}...", env!("CARGO_PKG_VERSION"));

    // --- Configuration ---
    let config = TenancyConfig::from_env()?;
    info!(?config, "Configuration loaded");

    // --- Registry Setup & Migrations ---
    let context = match TenancyContext::connect(&config).await {
        Ok(context) => context,
        Err(e) => {
            error!("Tenant registry setup failed: {}", e);
            return Err(e.into());
        }
    };

    // --- Bootstrap Targets ---
    match &config.bootstrap_targets {
        Some(path) => {
            let seeds = load_target_seeds(path)?;
            let inserted = context.allocator.seed_targets(&seeds).await?;
            info!(
                listed = seeds.len(),
                inserted,
                "Bootstrap targets from {} processed",
                path.display()
            );
        }
        None => info!("No bootstrap target list configured."),
    }

    // --- Optional Allocation ---
    if let Ok(code) = env::var(ENV_ALLOCATE_CODE) {
        let name = env::var(ENV_ALLOCATE_NAME).unwrap_or_else(|_| code.clone());
        match context.allocator.allocate(NewTenant::new(code, name)).await {
            Ok(record) => {
                info!(tenant_id = %record.id, code = %record.code, target_id = %record.target_id, "Tenant provisioned");
                // Prove the tenant's session opens with the stored credential
                let handle = context
                    .resolver
                    .resolve(&TenantIdentifier::Id(record.id))
                    .await?;
                info!(tenant_id = %handle.tenant_id(), "Tenant connection verified");
            }
            Err(e) => {
                warn!("Tenant allocation failed: {}", e);
                return Err(e.into());
            }
        }
    }

    // --- Inventory ---
    let summary = context.allocator.inventory().await?;
    info!(
        total = summary.total,
        allocated = summary.allocated,
        unallocated = summary.unallocated,
        "Target inventory"
    );
    if summary.unallocated == 0 {
        warn!("No unallocated targets left; new tenants will fail with PoolExhausted.");
    }

    Ok(())
}
