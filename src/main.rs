//! EVA-CORE command-line front end.
//!
//! ## CLI Subcommands
//!
//! - `eva-core-cli chat <model.gguf>` - Interactive chat session
//! - `eva-core-cli config` - Print the effective configuration
//! - `eva-core-cli version` - Show version information

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use eva_core::config::{self as eva_config, ConfigError, EvaConfig};
use eva_core::engine::ChatTemplateState;

/// Exit code for bad arguments or configuration.
const EXIT_CONFIG: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(|s| s.as_str()).unwrap_or("help");
    let rest = args.get(2..).unwrap_or_default();

    match command {
        "chat" => run_chat(rest).await,
        "config" => run_config(rest),
        "help" | "--help" | "-h" => {
            if let Some(subcommand) = args.get(2) {
                print_command_help(subcommand);
            } else {
                print_usage();
            }
            ExitCode::SUCCESS
        }
        "version" | "--version" | "-V" => {
            println!("eva-core {}", eva_core::VERSION);
            ExitCode::SUCCESS
        }
        _ => {
            eprintln!("Unknown command: {}", command);
            print_usage();
            ExitCode::FAILURE
        }
    }
}

#[derive(Debug, Default)]
struct ChatArgs {
    model: PathBuf,
    config: Option<PathBuf>,
    system: Option<String>,
    completion: bool,
    tools: bool,
}

fn parse_chat_args(args: &[String]) -> Result<ChatArgs, String> {
    let mut parsed = ChatArgs::default();
    let mut model = None;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" => {
                let value = iter.next().ok_or("--config needs a file")?;
                parsed.config = Some(PathBuf::from(value));
            }
            "--system" => {
                let value = iter.next().ok_or("--system needs a prompt")?;
                parsed.system = Some(value.clone());
            }
            "--completion" => parsed.completion = true,
            "--tools" => parsed.tools = true,
            flag if flag.starts_with("--") => return Err(format!("unknown option {flag}")),
            path if model.is_none() => model = Some(PathBuf::from(path)),
            extra => return Err(format!("unexpected argument {extra}")),
        }
    }
    parsed.model = model.ok_or("missing model path")?;
    Ok(parsed)
}

fn load_config(path: Option<&Path>) -> Result<EvaConfig, ConfigError> {
    match path {
        Some(path) => eva_config::load_file(path),
        None => eva_config::load(),
    }
}

fn build_template(args: &ChatArgs) -> ChatTemplateState {
    let mut template = if args.completion {
        ChatTemplateState::completion()
    } else {
        ChatTemplateState::default()
    };
    if let Some(system) = &args.system {
        template.persona.instruction = system.clone();
    }
    if args.tools {
        template = template.with_tools();
    }
    template
}

fn run_config(args: &[String]) -> ExitCode {
    let path = match args {
        [] => None,
        [flag, file] if flag == "--config" => Some(PathBuf::from(file)),
        _ => {
            print_command_help("config");
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    let rendered = load_config(path.as_deref()).and_then(|config| config.to_toml());
    match rendered {
        Ok(text) => {
            print!("{text}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            ExitCode::from(EXIT_CONFIG)
        }
    }
}

async fn run_chat(args: &[String]) -> ExitCode {
    let chat_args = match parse_chat_args(args) {
        Ok(parsed) => parsed,
        Err(e) => {
            eprintln!("chat: {}", e);
            print_command_help("chat");
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    let config = match load_config(chat_args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    if let Err(e) = eva_core::telemetry::init_logging(&config.logging) {
        eprintln!("Logging disabled: {}", e);
    }
    let template = build_template(&chat_args);

    #[cfg(feature = "gguf")]
    {
        let session = match eva_core::engine::Session::new(
            eva_core::engine::LlamaLoader,
            config.session,
        ) {
            Ok(session) => session.with_template(template),
            Err(e) => {
                eprintln!("Configuration error: {}", e);
                return ExitCode::from(EXIT_CONFIG);
            }
        };
        repl::run(session, chat_args.model).await
    }

    #[cfg(not(feature = "gguf"))]
    {
        let _ = (config, template);
        eprintln!(
            "eva-core-cli was built without an inference engine; rebuild with `--features gguf` to chat with {}",
            chat_args.model.display()
        );
        ExitCode::from(EXIT_CONFIG)
    }
}

/// Line-oriented chat loop over a shared session.
#[cfg(feature = "gguf")]
mod repl {
    use std::io::Write;
    use std::path::PathBuf;
    use std::process::ExitCode;
    use std::time::Duration;

    use eva_core::engine::{EngineLoader, PredictInput, Session, SharedSession};
    use tokio::io::{AsyncBufReadExt, BufReader};

    const STREAM_BUFFER: usize = 64;

    pub async fn run<L: EngineLoader + 'static>(session: Session<L>, model: PathBuf) -> ExitCode {
        let shared = SharedSession::new(session);

        let loader = shared.clone();
        let loaded = tokio::task::spawn_blocking(move || loader.lock().load(&model)).await;
        match loaded {
            Ok(Ok(info)) => eprintln!(
                "loaded: vocab {}, context {}, media {}",
                info.vocab_size, info.max_context, info.supports_media
            ),
            Ok(Err(e)) => {
                eprintln!("Load failed: {}", e);
                return ExitCode::FAILURE;
            }
            Err(e) => {
                eprintln!("Load task failed: {}", e);
                return ExitCode::FAILURE;
            }
        }

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut media: Vec<PathBuf> = Vec::new();
        loop {
            eprint!("> ");
            flush();
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    eprintln!("stdin: {}", e);
                    return ExitCode::FAILURE;
                }
            };

            let input = match line.trim_end() {
                "" => continue,
                "/quit" | "/exit" => break,
                "/reset" => {
                    let shared = shared.clone();
                    let result = tokio::task::spawn_blocking(move || {
                        let mut session = shared.lock();
                        let template = session.template().clone();
                        session.reset(&template)
                    })
                    .await;
                    match result {
                        Ok(Ok(outcome)) => eprintln!("reset ({:?})", outcome.path),
                        Ok(Err(e)) => eprintln!("reset failed: {}", e),
                        Err(e) => eprintln!("reset task failed: {}", e),
                    }
                    continue;
                }
                "/cache" => {
                    let session = shared.lock();
                    let state = session.state();
                    eprintln!(
                        "cache {:.1}% ({} tokens, {} protected)",
                        session.cache_fill_percent(),
                        state.n_past,
                        state.system_prefix_len
                    );
                    continue;
                }
                "/cache json" => {
                    match shared.lock().cache_json() {
                        Ok(json) => println!("{}", json),
                        Err(e) => eprintln!("cache export failed: {}", e),
                    }
                    continue;
                }
                cmd if cmd.starts_with("/image ") => {
                    media.push(PathBuf::from(cmd["/image ".len()..].trim()));
                    continue;
                }
                cmd if cmd.starts_with("/tool ") => PredictInput::tool(&cmd["/tool ".len()..]),
                text => PredictInput::user(text),
            };
            let input = media
                .drain(..)
                .fold(input, |input, path| input.with_media(path));

            stream_reply(&shared, input).await;
        }

        let _ = shared.stop_and_wait(Duration::from_secs(5)).await;
        ExitCode::SUCCESS
    }

    async fn stream_reply<L: EngineLoader + 'static>(shared: &SharedSession<L>, input: PredictInput) {
        let mut stream = shared.predict_stream(input, STREAM_BUFFER);
        loop {
            tokio::select! {
                item = stream.next() => match item {
                    Some(Ok(output)) => {
                        if let Some(chunk) = output.chunk {
                            if chunk.is_reasoning {
                                eprint!("{}", chunk.text);
                            } else {
                                print!("{}", chunk.text);
                            }
                            flush();
                        }
                        if let Some(reason) = output.finish_reason() {
                            println!();
                            tracing::debug!(reason = reason.as_str(), "reply finished");
                        }
                    }
                    Some(Err(e)) => {
                        println!();
                        eprintln!("error: {}", e);
                    }
                    None => break,
                },
                _ = tokio::signal::ctrl_c() => {
                    stream.stop();
                }
            }
        }
    }

    fn flush() {
        let _ = std::io::stdout().flush();
        let _ = std::io::stderr().flush();
    }
}

fn print_usage() {
    let version = eva_core::VERSION;
    eprintln!(
        "eva-core - inference session engine v{}

USAGE:
    eva-core-cli [COMMAND] [OPTIONS]

COMMANDS:
    chat         Chat with a GGUF model
    config       Print the effective configuration as TOML
    version      Show version information
    help         Show this help message

OPTIONS:
    -h, --help     Show help for command
    -V, --version  Show version information

EXAMPLES:
    eva-core-cli chat model.gguf
    eva-core-cli chat model.gguf --system \"You are terse.\"
    eva-core-cli chat model.gguf --completion
    eva-core-cli config --config eva.toml

ENVIRONMENT:
    EVA_CORE_CONFIG      Configuration file
    EVA_CORE_LOG         Log filter (debug, info, warn, error)
    EVA_CORE_N_CTX       Context window in tokens

EXIT CODES:
    0  Success
    1  Failure
    2  Configuration error
",
        version
    );
}

/// Print detailed help for a specific command.
fn print_command_help(command: &str) {
    match command {
        "chat" => {
            eprintln!(
                "eva-core-cli chat - Interactive chat session

USAGE:
    eva-core-cli chat <MODEL> [OPTIONS]

OPTIONS:
    --config FILE     Load configuration from file
    --system TEXT     System instruction
    --completion      Raw completion mode (no chat template)
    --tools           Stop where the model expects a tool result

COMMANDS INSIDE THE SESSION:
    /tool TEXT        Send TEXT as a tool result
    /image PATH       Attach media to the next message
    /reset            Drop the conversation, keep the system prompt
    /cache            Show cache fill
    /cache json       Print every cached token as JSON
    /quit             Leave

Ctrl-C stops the reply being generated.
"
            );
        }
        "config" => {
            eprintln!(
                "eva-core-cli config - Print the effective configuration

USAGE:
    eva-core-cli config [--config FILE]

DESCRIPTION:
    Loads defaults, the given file (or EVA_CORE_CONFIG) and EVA_CORE_*
    environment variables, validates the result and prints it as TOML.
"
            );
        }
        _ => print_usage(),
    }
}
