//! Live-cluster tests
//!
//! These need a reachable control node and a key it accepts:
//!
//! ```text
//! NODESHELL_TEST_MASTER=10.0.0.1 NODESHELL_TEST_AGENT=10.0.3.7 \
//!     cargo test -p nodeshell --test cluster -- --ignored
//! ```
//!
//! Username and key come from `NODESHELL_USERNAME` / `NODESHELL_KEY_PATH`.

use anyhow::{Context, Result};
use nodeshell::ssh::Ssh2Connector;
use nodeshell::{CommandRunner, RunOptions, RunnerConfig};
use std::sync::Arc;

fn runner() -> Result<Option<CommandRunner>> {
    let Ok(master) = std::env::var("NODESHELL_TEST_MASTER") else {
        eprintln!("NODESHELL_TEST_MASTER not set, skipping");
        return Ok(None);
    };
    let config = RunnerConfig::from_env()
        .context("loading config")?
        .with_master(master)
        .with_noisy(false);
    let runner = CommandRunner::from_config(config, Arc::new(Ssh2Connector::default()))
        .context("building runner")?;
    Ok(Some(runner))
}

#[tokio::test]
#[ignore]
async fn test_master_commands() -> Result<()> {
    let Some(runner) = runner()? else { return Ok(()) };
    let options = RunOptions::quiet();

    assert_eq!(runner.run_command_on_master("true", &options).await.into_pair(), (true, String::new()));
    assert_eq!(runner.run_command_on_master("false", &options).await.into_pair(), (false, String::new()));
    assert_eq!(
        runner.run_command_on_master("echo hi", &options).await.into_pair(),
        (true, "hi\n".to_string())
    );

    let master = runner.config().master.clone().unwrap_or_default();
    let status = runner.run_command_with_status(&master, "exit 7", &options).await;
    assert_eq!(status.exit_code, 7);

    runner.shutdown().await?;
    Ok(())
}

#[tokio::test]
#[ignore]
async fn test_connection_is_reused() -> Result<()> {
    let Some(runner) = runner()? else { return Ok(()) };
    let options = RunOptions::quiet();

    for _ in 0..5 {
        assert!(runner.run_command_on_master("true", &options).await.success);
    }
    assert_eq!(runner.pool().len().await, 1);

    runner.shutdown().await?;
    assert!(runner.pool().is_empty().await);
    Ok(())
}

#[tokio::test]
#[ignore]
async fn test_agent_through_master() -> Result<()> {
    let Some(runner) = runner()? else { return Ok(()) };
    let Ok(agent) = std::env::var("NODESHELL_TEST_AGENT") else {
        eprintln!("NODESHELL_TEST_AGENT not set, skipping");
        return Ok(());
    };

    let result = runner.run_command_on_agent(&agent, "uname -a", &RunOptions::quiet()).await;
    assert!(result.success, "uname failed: {}", result.output);
    assert!(result.output.contains("Linux"));
    assert_eq!(runner.pool().stats().await.proxied, 1);

    runner.shutdown().await?;
    Ok(())
}

#[tokio::test]
#[ignore]
async fn test_large_output_is_complete() -> Result<()> {
    let Some(runner) = runner()? else { return Ok(()) };

    let result = runner
        .run_command_on_master("seq 1 20000", &RunOptions::quiet())
        .await;

    assert!(result.success);
    let lines: Vec<_> = result.output.lines().collect();
    assert_eq!(lines.len(), 20000);
    assert_eq!(lines.last().copied(), Some("20000"));

    runner.shutdown().await?;
    Ok(())
}

#[tokio::test]
#[ignore]
async fn test_unreachable_host() -> Result<()> {
    let Some(runner) = runner()? else { return Ok(()) };

    let result = runner.run_command("10.255.255.1", "echo hi", &RunOptions::quiet()).await;
    assert_eq!(result.into_pair(), (false, String::new()));

    runner.shutdown().await?;
    Ok(())
}
