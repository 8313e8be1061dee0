// DWP host - run a simulated program under the debugger agent
//
// Loads a scripted program (the built-in demo or a JSON file), starts the
// agent with the given options and runs the program until it exits.

use anyhow::{Context, Result};
use clap::Parser;
use dwp_agent::sim::{Program, SimHost};
use dwp_agent::{Agent, AgentConfig};
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "dwp-host", version, about = "Run a simulated program under the DWP debugger agent")]
struct Cli {
    /// Agent options, e.g. transport=dt_socket,address=127.0.0.1:55555,server=y
    #[arg(long, env = "DWP_AGENT", default_value = "help")]
    agent: String,

    /// JSON program description; runs the built-in demo when omitted
    #[arg(long)]
    program: Option<PathBuf>,

    /// Exit code the program finishes with
    #[arg(long)]
    exit_code: Option<i32>,

    /// Print the demo program as JSON and exit
    #[arg(long)]
    dump_demo: bool,
}

fn init_logging(config: &AgentConfig) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(config.log_directive().parse()?);

    // Logs go to stderr unless a log file was asked for
    match &config.log_file {
        Some(path) => {
            let file = std::fs::File::create(path)
                .with_context(|| format!("cannot create log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}

fn load_program(path: Option<&Path>) -> Result<Program> {
    match path {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("cannot read program {}", path.display()))?;
            Program::from_json(&json).with_context(|| format!("invalid program {}", path.display()))
        }
        None => Ok(Program::demo()),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.dump_demo {
        println!("{}", serde_json::to_string_pretty(&Program::demo())?);
        return Ok(());
    }

    let config = AgentConfig::from_options_and_env(&cli.agent).context("invalid agent options")?;
    if config.help {
        println!("{}", AgentConfig::usage());
        return Ok(());
    }
    init_logging(&config)?;

    let mut program = load_program(cli.program.as_deref())?;
    if let Some(code) = cli.exit_code {
        program.exit_code = code;
    }

    let host = SimHost::new(program);
    let agent = Agent::new(config, host.clone());
    host.attach(&agent);

    if let Some(addr) = agent.start().context("failed to start the debugger agent")? {
        info!("Debugger agent listening on {}", addr);
    }

    let exit_code = host.run().context("program failed")?;
    agent.shutdown();
    info!("dwp-host exiting with {}", exit_code);
    std::process::exit(exit_code);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_cli_parses_agent_options() {
        let cli = Cli::parse_from([
            "dwp-host",
            "--agent",
            "transport=dt_socket,address=55555,server=y",
            "--exit-code",
            "3",
        ]);
        assert_eq!(cli.exit_code, Some(3));
        assert!(cli.program.is_none());

        let config = AgentConfig::parse(&cli.agent).unwrap();
        assert!(config.server);
    }

    #[test]
    fn test_load_program_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let json = serde_json::to_string(&Program::demo()).unwrap();
        file.write_all(json.as_bytes()).unwrap();

        let program = load_program(Some(file.path())).unwrap();
        assert_eq!(program.methods.len(), Program::demo().methods.len());
    }

    #[test]
    fn test_load_program_reports_bad_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"{ not json").unwrap();
        let err = load_program(Some(file.path())).unwrap_err();
        assert!(err.to_string().contains("invalid program"));
    }

    #[test]
    fn test_demo_without_a_file() {
        assert!(!load_program(None).unwrap().threads.is_empty());
    }
}
