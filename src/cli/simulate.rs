//! `dlquota simulate`: several engines sharing one in-memory store.

use std::sync::Arc;

use anyhow::{bail, Result};

use dlquota::{
    Config, DownloadQuotaLimitsView, InMemoryQuotaRepository, MemoryNotifier, QuotaEngine,
    QuotaError, QuotaKey, StaticTenants,
};

use super::SimulateArgs;

/// Per-user result of a simulation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct UserOutcome {
    pub email: String,
    pub admitted: usize,
    pub denied: usize,
    /// Effective quota as seen by each instance after the final sync.
    pub views: Vec<i64>,
}

#[derive(Debug)]
pub(crate) struct SimulationOutcome {
    pub instances: Vec<String>,
    pub users: Vec<UserOutcome>,
    pub notifications: usize,
}

/// Handle `dlquota simulate`.
pub(crate) async fn cmd_simulate(args: SimulateArgs) -> Result<()> {
    let outcome = run_simulation(&args).await?;

    println!(
        "{} instances, {} users, {} attempts per user per instance, max quota {}",
        outcome.instances.len(),
        outcome.users.len(),
        args.downloads,
        args.max_quota
    );
    println!();

    let mut header = format!("{:<24} {:>9} {:>7}", "User", "Admitted", "Denied");
    for i in 0..outcome.instances.len() {
        header.push_str(&format!(" {:>8}", format!("view#{i}")));
    }
    println!("{header}");
    println!("{}", "-".repeat(header.len()));

    for user in &outcome.users {
        let mut line = format!("{:<24} {:>9} {:>7}", user.email, user.admitted, user.denied);
        for view in &user.views {
            line.push_str(&format!(" {view:>8}"));
        }
        println!("{line}");
    }

    println!();
    println!("Notifications sent: {}", outcome.notifications);
    Ok(())
}

/// Run the simulation and stop every engine.
///
/// Instances take turns: each one attempts `downloads` transfers for every
/// user. Unless `args.isolated`, all instances reconcile between turns, so later
/// instances see the usage of earlier ones.
pub(crate) async fn run_simulation(args: &SimulateArgs) -> Result<SimulationOutcome> {
    if args.instances == 0 || args.users == 0 {
        bail!("--instances and --users must be at least 1");
    }

    let repository = Arc::new(InMemoryQuotaRepository::new());
    let notifier = Arc::new(MemoryNotifier::new());
    let config = Config {
        tenants: vec![args.tenant.clone()],
        ..Config::default()
    };

    let mut engines = Vec::with_capacity(args.instances);
    for _ in 0..args.instances {
        let engine = QuotaEngine::start(
            config.clone(),
            repository.clone(),
            notifier.clone(),
            Arc::new(StaticTenants::new([args.tenant.clone()])),
        )
        .await?;
        engines.push(engine);
    }

    let emails: Vec<String> = (0..args.users)
        .map(|i| format!("user{i}@{}", args.tenant))
        .collect();
    for email in &emails {
        engines[0]
            .service()
            .upsert_download_quota_limits(
                &args.tenant,
                DownloadQuotaLimitsView {
                    email: email.clone(),
                    max_quota: args.max_quota,
                    rate_limit: args.rate_limit,
                },
            )
            .await?;
    }

    let mut users: Vec<UserOutcome> = emails
        .iter()
        .map(|email| UserOutcome {
            email: email.clone(),
            admitted: 0,
            denied: 0,
            views: Vec::new(),
        })
        .collect();

    for engine in &engines {
        for user in users.iter_mut() {
            let key = QuotaKey::new(args.tenant.as_str(), user.email.as_str());
            for n in 0..args.downloads {
                let resource = format!("file-{n}.bin");
                let result: dlquota::Result<()> = engine
                    .service()
                    .with_quota(&key, &resource, |handler| async move {
                        handler.start()?;
                        handler.stop()
                    })
                    .await;
                match result {
                    Ok(()) => user.admitted += 1,
                    Err(err) if err.is_denial() => user.denied += 1,
                    Err(err) => return Err(err.into()),
                }
            }
        }
        if !args.isolated {
            sync_all(&engines).await;
        }
    }

    // Twice: the first pass writes every diff, the second reads the final sums.
    sync_all(&engines).await;
    sync_all(&engines).await;

    for user in users.iter_mut() {
        let key = QuotaKey::new(args.tenant.as_str(), user.email.as_str());
        for engine in &engines {
            let current = engine.service().get_current_quotas(&key).await?;
            user.views.push(current.current_quota);
        }
    }

    let instances = engines
        .iter()
        .map(|engine| engine.manager().instance_id().to_string())
        .collect();
    for engine in engines {
        let report = engine.shutdown().await;
        if report.retained > 0 {
            return Err(QuotaError::Config(format!(
                "{} keys were not reconciled",
                report.retained
            ))
            .into());
        }
    }

    Ok(SimulationOutcome {
        instances,
        users,
        notifications: notifier.sent().len(),
    })
}

async fn sync_all(engines: &[QuotaEngine]) {
    for engine in engines {
        engine.sync_now().await;
    }
}
