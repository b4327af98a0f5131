// sitevault/src/restore/upgrade.rs
use futures::future::BoxFuture;
use rust_decimal::Decimal;

use crate::errors::Result;
use crate::operation::OperationLog;
use crate::schema::ConfigOverride;
use crate::site::Site;

/// Name of the configuration value holding the site version.
pub const VERSION_CONFIG: &str = "version";

type UpgradeFn = Box<dyn for<'a> Fn(&'a Site) -> BoxFuture<'a, Result<()>> + Send + Sync>;

/// Migration that brings data from an older release up to `version`.
pub struct UpgradeStep {
    pub version: Decimal,
    pub name: String,
    run: UpgradeFn,
}

/// Post-restore migrations, keyed by the version they upgrade to.
#[derive(Default)]
pub struct UpgradeRegistry {
    steps: Vec<UpgradeStep>,
}

impl UpgradeRegistry {
    pub fn register<F>(&mut self, version: Decimal, name: &str, run: F)
    where
        F: for<'a> Fn(&'a Site) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
    {
        self.steps.push(UpgradeStep {
            version,
            name: name.to_string(),
            run: Box::new(run),
        });
    }

    /// Steps shipped with the tool.
    pub fn builtin() -> Self {
        let mut registry = UpgradeRegistry::default();
        registry.register(Decimal::new(2021051708, 0), "release_311", release_311);
        registry
    }

    /// Steps with `origin < version <= target`, ascending.
    pub fn pending(&self, origin: Decimal, target: Decimal) -> Vec<&UpgradeStep> {
        let mut steps: Vec<&UpgradeStep> = self
            .steps
            .iter()
            .filter(|s| s.version > origin && s.version <= target)
            .collect();
        steps.sort_by(|a, b| a.version.cmp(&b.version));
        steps
    }
}

async fn set_core_config(site: &Site, name: &str, value: &str) -> Result<()> {
    site.db
        .set_config(&ConfigOverride {
            name: name.to_string(),
            plugin: None,
            value: value.to_string(),
        })
        .await
}

/// Release 3.11.8: records the release and branch a pre-3.11 backup is
/// brought up to and clears a stale upgrade flag.
fn release_311(site: &Site) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        set_core_config(site, "release", "3.11.8").await?;
        set_core_config(site, "branch", "311").await?;
        set_core_config(site, "upgraderunning", "0").await
    })
}

/// Runs the pending migrations and stamps the site version. Each failing step
/// is logged and the next one still runs. Returns the number of steps that
/// succeeded.
pub async fn upgrade_after_restore(
    site: &Site,
    origin: Option<Decimal>,
    log: &OperationLog,
) -> Result<usize> {
    let target = site.settings.site_version;
    let Some(origin) = origin else {
        log.warn("Backup does not record its version, upgrade steps skipped").await;
        return Ok(0);
    };
    if origin >= target {
        return Ok(0);
    }

    log.info(format!("Upgrading restored data from {} to {}", origin, target)).await;
    let mut succeeded = 0;
    for step in site.upgrades.pending(origin, target) {
        site.host.extend_timeout();
        match (step.run)(site).await {
            Ok(()) => {
                log.info(format!("Upgrade step {} ({}) done", step.name, step.version)).await;
                succeeded += 1;
            }
            Err(e) => {
                log.warn(format!("Upgrade step {} ({}) failed: {}", step.name, step.version, e))
                    .await
            }
        }
    }

    set_core_config(site, VERSION_CONFIG, &target.to_string()).await?;
    Ok(succeeded)
}
