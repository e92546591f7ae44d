use anyhow::Context;
use clap::{Parser, Subcommand};
use nix::unistd::Pid;
use pldbg::config::Config;
use pldbg::debugger::breakpoint::{Oid, SharedRegion, Target};
use pldbg::debugger::process::{ProcessIdentity, SystemProcessTable};
use pldbg::proxy::{GlobalProxy, ProxySession};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::path::PathBuf;

const PROMPT: &str = "(pldbg) ";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(long, env = "PLDBG_CONFIG")]
    config: Option<PathBuf>,

    /// Mute library logging
    #[arg(short, long, default_value_t = false)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Attach to a worker that announced a break notice
    Attach {
        #[arg(long, default_value_t = String::from("127.0.0.1"))]
        host: String,

        /// Port from the `PLDBGBREAK:<port>` notice
        #[arg(long)]
        port: u16,
    },
    /// Set a global breakpoint and wait for workers to hit it
    Listen {
        #[arg(long)]
        database: Oid,

        #[arg(long)]
        routine: Oid,

        #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
        line: i32,

        /// Only stop in the worker with this pid
        #[arg(long)]
        target: Option<i32>,

        /// Exit after the first session
        #[arg(long, default_value_t = false)]
        oneshot: bool,
    },
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();
    if args.quiet {
        pldbg::log::disable();
    }

    let config = Config::from_file(args.config.as_deref()).context("load configuration")?;
    let identity =
        ProcessIdentity::current(&SystemProcessTable).context("resolve proxy identity")?;

    match args.command {
        Command::Attach { host, port } => {
            let mut session = ProxySession::attach_to_target(&host, port, &identity)
                .with_context(|| format!("attach to {host}:{port}"))?;
            println!("attached to target at {host}:{port}");
            repl(&mut session)?;
            session.close()?;
        }
        Command::Listen {
            database,
            routine,
            line,
            target,
            oneshot,
        } => {
            let region = SharedRegion::open(&config.region_path).with_context(|| {
                format!("open breakpoint region {}", config.region_path.display())
            })?;
            let target = target.map_or(Target::Any, |pid| Target::Process(Pid::from_raw(pid)));

            let mut proxy = GlobalProxy::bind(
                &config.attach.proxy_host,
                region,
                database,
                identity,
                Box::new(SystemProcessTable),
            )?;
            if !proxy.set_global_breakpoint(routine, line, target)? {
                anyhow::bail!("breakpoint {routine}:{line} already exists");
            }
            println!(
                "breakpoint {routine}:{line} set, waiting on port {}",
                proxy.port()
            );

            loop {
                let mut session = proxy.wait_for_target()?;
                println!("target attached");
                let result = repl(&mut session);
                proxy.end_session(session)?;
                result?;
                if oneshot {
                    break;
                }
            }
            proxy.shutdown()?;
        }
    }

    Ok(())
}

/// Send every input line to the target and print its reply, `q` quits.
fn repl(session: &mut ProxySession) -> anyhow::Result<()> {
    let mut editor = DefaultEditor::new()?;
    loop {
        match editor.readline(PROMPT) {
            Ok(input) => {
                let input = input.trim();
                if input.is_empty() {
                    continue;
                }
                if input == "q" || input == "quit" {
                    return Ok(());
                }
                _ = editor.add_history_entry(input);
                let reply = session.request(input).context("send command")?;
                println!("{reply}");
            }
            Err(ReadlineError::Eof | ReadlineError::Interrupted) => return Ok(()),
            Err(err) => return Err(err.into()),
        }
    }
}
