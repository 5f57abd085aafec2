//! Controller-side inspection tool.
//!
//! # Responsibility
//! - Verify `sandbox_agent` linkage with deterministic output.
//! - Look up where an attached namespace's control server listens.
//!
//! # Usage
//! - `sandbox_cli [ping]`
//! - `sandbox_cli version`
//! - `sandbox_cli lookup <RESULT_FILE> <NAMESPACE> [TOKEN] [--json]`

use clap::{Parser, Subcommand};
use sandbox_agent::{lookup_attach_result, AttachResult};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "sandbox_cli")]
#[command(about = "Inspect an attached sandbox agent")]
struct Cli {
    /// Defaults to `ping`.
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Command {
    /// Print the agent linkage check and version.
    Ping,
    /// Print the agent version.
    Version,
    /// Print where a namespace's control server listens.
    Lookup {
        /// Attach result file written by the agent.
        result_file: PathBuf,
        namespace: String,
        /// Narrow the lookup to one attach token.
        token: Option<String>,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli.command.unwrap_or(Command::Ping)) {
        Ok(output) => {
            println!("{output}");
            ExitCode::SUCCESS
        }
        Err(message) => {
            eprintln!("sandbox_cli: {message}");
            ExitCode::FAILURE
        }
    }
}

fn run(command: Command) -> Result<String, String> {
    match command {
        Command::Ping => Ok(format!(
            "sandbox_agent ping={}\nsandbox_agent version={}",
            sandbox_agent::ping(),
            sandbox_agent::agent_version()
        )),
        Command::Version => Ok(format!(
            "sandbox_agent version={}",
            sandbox_agent::agent_version()
        )),
        Command::Lookup {
            result_file,
            namespace,
            token,
            json,
        } => {
            let found = lookup_attach_result(&result_file, &namespace, token.as_deref())
                .map_err(|err| err.to_string())?
                .ok_or_else(|| format!("no attach record for namespace `{namespace}`"))?;
            render(&found, json)
        }
    }
}

fn render(result: &AttachResult, json: bool) -> Result<String, String> {
    if json {
        return serde_json::to_string(result).map_err(|err| err.to_string());
    }
    Ok(format!(
        "namespace={} token={} host={} port={}",
        result.namespace, result.token, result.host, result.port
    ))
}

#[cfg(test)]
mod tests {
    use super::{run, Cli, Command};
    use clap::Parser;
    use sandbox_agent::{append_attach_result, AttachResult};
    use std::path::PathBuf;

    fn parse(args: &[&str]) -> Result<Option<Command>, clap::Error> {
        Cli::try_parse_from(std::iter::once("sandbox_cli").chain(args.iter().copied()))
            .map(|cli| cli.command)
    }

    #[test]
    fn no_arguments_means_ping() {
        assert_eq!(parse(&[]).expect("no command"), None);
        assert_eq!(parse(&["ping"]).expect("ping"), Some(Command::Ping));
        let output = run(Command::Ping).expect("ping output");
        assert!(output.starts_with("sandbox_agent ping=pong"));
    }

    #[test]
    fn parses_lookup_with_optional_token_and_json_flag() {
        assert_eq!(
            parse(&["lookup", "/tmp/r", "alpha", "--json"]).expect("lookup"),
            Some(Command::Lookup {
                result_file: PathBuf::from("/tmp/r"),
                namespace: "alpha".to_string(),
                token: None,
                json: true,
            })
        );
        assert!(matches!(
            parse(&["lookup", "/tmp/r", "alpha", "t-1"]),
            Ok(Some(Command::Lookup { token: Some(_), json: false, .. }))
        ));
    }

    #[test]
    fn rejects_illegal_arguments() {
        assert!(parse(&["lookup", "/tmp/r"]).is_err());
        assert!(parse(&["lookup", "/tmp/r", "a", "t", "extra"]).is_err());
        assert!(parse(&["lookup", "/tmp/r", "a", "--yaml"]).is_err());
        assert!(parse(&["version", "now"]).is_err());
        assert!(parse(&["detach"]).is_err());
    }

    #[test]
    fn lookup_renders_latest_record_as_json() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(".sandbox.token");
        let local = "127.0.0.1:4100".parse().expect("addr");
        append_attach_result(&path, &AttachResult::new("alpha", "t-1", local)).expect("append");
        let local = "127.0.0.1:4200".parse().expect("addr");
        append_attach_result(&path, &AttachResult::new("alpha", "t-2", local)).expect("append");

        let output = run(Command::Lookup {
            result_file: path.clone(),
            namespace: "alpha".to_string(),
            token: None,
            json: true,
        })
        .expect("lookup output");
        let value: serde_json::Value = serde_json::from_str(&output).expect("json");
        assert_eq!(value["namespace"], "alpha");
        assert_eq!(value["token"], "t-2");
        assert_eq!(value["port"], 4200);

        let missing = run(Command::Lookup {
            result_file: path,
            namespace: "beta".to_string(),
            token: None,
            json: false,
        });
        assert!(missing.is_err());
    }
}
