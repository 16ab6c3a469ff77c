//! Nodeshell command-line runner
//!
//! Runs one command on a cluster node and exits with its status.

use anyhow::{bail, Result};
use clap::{ArgGroup, Parser};
use nodeshell::ssh::Ssh2Connector;
use nodeshell::{CommandOutput, CommandRunner, RunOptions, RunnerConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Run a shell command on a cluster node over SSH.
///
/// Nodes other than the control node are reached through it.
#[derive(Parser, Debug)]
#[command(name = "nodeshell", version)]
#[command(group(ArgGroup::new("role").args(["master", "leader", "agent"])))]
struct Cli {
    /// JSON config file; NODESHELL_* environment variables override it
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Print only the command output
    #[arg(short, long)]
    quiet: bool,

    /// Run on the control node
    #[arg(long)]
    master: bool,

    /// Run on the leader
    #[arg(long)]
    leader: bool,

    /// Run on an agent, through the control node
    #[arg(long, value_name = "HOST")]
    agent: Option<String>,

    /// `HOST COMMAND...` when no role is given, otherwise just `COMMAND...`
    #[arg(required = true, trailing_var_arg = true, value_name = "ARGS")]
    args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Target {
    Master,
    Leader,
    Agent(String),
    Host(String),
}

impl Cli {
    /// Split the trailing arguments into the target and the command line
    fn invocation(&self) -> Result<(Target, String)> {
        let (target, command) = if self.master {
            (Target::Master, &self.args[..])
        } else if self.leader {
            (Target::Leader, &self.args[..])
        } else if let Some(host) = &self.agent {
            (Target::Agent(host.clone()), &self.args[..])
        } else {
            match self.args.split_first() {
                Some((host, rest)) => (Target::Host(host.clone()), rest),
                None => bail!("no host given"),
            }
        };

        let command = command.join(" ");
        if command.trim().is_empty() {
            bail!("no command given");
        }
        Ok((target, command))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let (target, command) = cli.invocation()?;

    let config = RunnerConfig::load(cli.config.as_deref())?;
    let runner = CommandRunner::from_config(config, Arc::new(Ssh2Connector::default()))?;
    let options = RunOptions::new().with_noisy(!cli.quiet);

    info!("Running `{}` on {:?}", command, target);
    let result: CommandOutput = match &target {
        Target::Master => runner.run_command_on_master(&command, &options).await,
        Target::Leader => runner.run_command_on_leader(&command, &options).await,
        Target::Agent(host) => runner.run_command_on_agent(host, &command, &options).await,
        Target::Host(host) => runner.run_command(host, &command, &options).await,
    };

    if cli.quiet {
        print!("{}", result.output);
    }
    runner.shutdown().await?;

    if !result.success {
        std::process::exit(1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &str) -> std::result::Result<Cli, clap::Error> {
        Cli::try_parse_from(std::iter::once("nodeshell").chain(line.split_whitespace()))
    }

    #[test]
    fn test_parse_host_target() {
        let cli = parse("10.0.0.5 uname -a").unwrap();
        let (target, command) = cli.invocation().unwrap();
        assert_eq!(target, Target::Host("10.0.0.5".to_string()));
        assert_eq!(command, "uname -a");
        assert!(!cli.quiet);
    }

    #[test]
    fn test_parse_roles_and_flags() {
        let cli = parse("--config /etc/nodeshell.json -q --agent 10.0.3.2 docker ps").unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/etc/nodeshell.json")));
        assert!(cli.quiet);
        assert_eq!(
            cli.invocation().unwrap(),
            (Target::Agent("10.0.3.2".to_string()), "docker ps".to_string())
        );

        assert_eq!(parse("--master true").unwrap().invocation().unwrap().0, Target::Master);
        assert_eq!(parse("--leader true").unwrap().invocation().unwrap().0, Target::Leader);
    }

    #[test]
    fn test_command_keeps_its_own_flags() {
        let cli = parse("--master ls -la --color").unwrap();
        assert_eq!(cli.invocation().unwrap().1, "ls -la --color");
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse("").is_err());
        assert!(parse("--master").is_err());
        assert!(parse("--agent").is_err());
        assert!(parse("--bogus true").is_err());
        assert!(parse("--master --leader true").is_err());
        assert!(parse("10.0.0.5").unwrap().invocation().is_err());
    }

    #[test]
    fn test_cli_definition() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
