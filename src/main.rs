//! Purpose: `patient-query` CLI entry point and command dispatch.
//! Role: Binary crate root; parses args, runs commands, emits JSON on stdout.
//! Invariants: Successful commands print exactly one JSON document on stdout.
//! Invariants: Non-interactive errors are emitted as JSON on stderr.
//! Invariants: Process exit code is derived from `api::to_exit_code`.
#![allow(clippy::result_large_err)]
use std::io::{self, IsTerminal};
use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{
    CommandFactory, Parser, Subcommand, ValueEnum, ValueHint, error::ErrorKind as ClapErrorKind,
};
use clap_complete::aot::Shell;
use serde_json::{Map, Value, json};
use std::error::Error as StdError;

mod serve;

use patient_query::api::{
    self, DEFAULT_DATA_PATH, Error, ErrorKind, Query, RemoteClient, Store, to_exit_code,
};

fn main() {
    let exit_code = match run() {
        Ok(code) => code,
        Err((err, color_mode)) => {
            emit_error(&err, color_mode);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<i32, (Error, ColorMode)> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    (
                        Error::new(ErrorKind::Io)
                            .with_message("failed to write help")
                            .with_source(io_err),
                        ColorMode::Auto,
                    )
                })?;
                let exit_code = if matches!(
                    err.kind(),
                    ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
                ) {
                    2
                } else {
                    0
                };
                return Ok(exit_code);
            }
            _ => {
                return Err((
                    Error::new(ErrorKind::Usage)
                        .with_message(clap_error_summary(&err))
                        .with_hint("Try `patient-query --help`."),
                    ColorMode::Auto,
                ));
            }
        },
    };

    let color_mode = cli.color;
    let source = match cli.remote {
        Some(url) => Source::Remote(url),
        None => Source::Local(cli.data),
    };
    dispatch(cli.command, source)
        .map(|()| 0)
        .map_err(|err| (err, color_mode))
}

#[derive(Parser)]
#[command(
    name = "patient-query",
    version,
    about = "Read-only queries over a patient records file",
    long_about = None,
    after_help = r#"EXAMPLES
  $ patient-query serve --data patients.json
  $ patient-query search P001
  $ patient-query query --city Guwahati --sort-by name --order asc
  $ patient-query --remote http://127.0.0.1:8000 query --age 30"#,
    arg_required_else_help = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        default_value = DEFAULT_DATA_PATH,
        help = "Patient records file (JSON object keyed by patient id)",
        value_hint = ValueHint::FilePath
    )]
    data: PathBuf,
    #[arg(
        long,
        global = true,
        value_name = "URL",
        help = "Query a running server instead of reading --data"
    )]
    remote: Option<String>,
    #[arg(
        long,
        global = true,
        default_value = "auto",
        value_enum,
        help = "Colorize stderr diagnostics: auto|always|never"
    )]
    color: ColorMode,

    #[command(subcommand)]
    command: Command,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum ColorMode {
    Auto,
    Always,
    Never,
}

impl ColorMode {
    fn use_color(self, is_tty: bool) -> bool {
        match self {
            ColorMode::Auto => is_tty,
            ColorMode::Always => true,
            ColorMode::Never => false,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    #[command(about = "Serve the records over HTTP (loopback by default)")]
    Serve {
        #[arg(long, default_value = "127.0.0.1:8000", help = "Bind address")]
        bind: String,
        #[arg(
            long = "cors-origin",
            value_name = "ORIGIN",
            help = "Allow browser requests from this origin (repeatable)"
        )]
        cors_origin: Vec<String>,
        #[arg(long, help = "Allow non-loopback binds")]
        allow_non_loopback: bool,
    },
    #[command(about = "Print every record keyed by patient id")]
    View,
    #[command(about = "Print one record by patient id")]
    Search {
        #[arg(help = "Patient id, e.g. P001")]
        patient_id: String,
    },
    #[command(
        about = "Filter records by exact name/age/city and optionally sort",
        after_help = r#"Sorting compares values as text, so age 10 sorts before age 9."#
    )]
    Query {
        #[arg(long, help = "Exact patient name")]
        name: Option<String>,
        #[arg(long, help = "Exact age", allow_negative_numbers = true)]
        age: Option<i64>,
        #[arg(long, help = "Exact city")]
        city: Option<String>,
        #[arg(long, value_name = "FIELD", help = "Sort by name, age, or city")]
        sort_by: Option<String>,
        #[arg(long, value_name = "ORDER", help = "asc (default) or desc")]
        order: Option<String>,
    },
    #[command(about = "Generate shell completion scripts")]
    Completion {
        #[arg(value_enum)]
        shell: Shell,
    },
}

enum Source {
    Local(PathBuf),
    Remote(String),
}

fn dispatch(command: Command, source: Source) -> Result<(), Error> {
    match command {
        Command::Serve {
            bind,
            cors_origin,
            allow_non_loopback,
        } => {
            let Source::Local(data_path) = source else {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message("serve reads a local data file; --remote is not allowed")
                    .with_hint("Drop --remote and pass --data <PATH>."));
            };
            let bind: SocketAddr = bind.parse().map_err(|_| {
                Error::new(ErrorKind::Usage)
                    .with_message("invalid bind address")
                    .with_hint("Use a host:port value like 127.0.0.1:8000.")
            })?;
            let config = serve::ServeConfig {
                bind,
                data_path,
                cors_allowed_origins: cors_origin,
                allow_non_loopback,
            };
            serve::preflight_config(&config)?;
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .map_err(|err| {
                    Error::new(ErrorKind::Internal)
                        .with_message("failed to start runtime")
                        .with_source(err)
                })?;
            runtime.block_on(serve::serve(config))
        }
        Command::View => {
            let value = match source {
                Source::Local(path) => load_store(&path)?.get_all().to_value(),
                Source::Remote(url) => {
                    let client = RemoteClient::new(url)?;
                    client.view().map_err(|err| remote_hint(&client, err))?.to_value()
                }
            };
            emit_json(&value);
            Ok(())
        }
        Command::Search { patient_id } => {
            let value = match source {
                Source::Local(path) => load_store(&path)?.get_by_id(&patient_id)?.to_value(),
                Source::Remote(url) => {
                    let client = RemoteClient::new(url)?;
                    client
                        .search(&patient_id)
                        .map_err(|err| remote_hint(&client, err))?
                        .to_value()
                }
            };
            emit_json(&value);
            Ok(())
        }
        Command::Query {
            name,
            age,
            city,
            sort_by,
            order,
        } => {
            let query = Query {
                name,
                age,
                city,
                sort_by,
                order,
            };
            let records: Vec<Value> = match source {
                Source::Local(path) => load_store(&path)?
                    .filter_and_sort(&query)?
                    .into_iter()
                    .map(|record| record.to_value())
                    .collect(),
                Source::Remote(url) => {
                    let client = RemoteClient::new(url)?;
                    client
                        .query(&query)
                        .map_err(|err| remote_hint(&client, err))?
                        .iter()
                        .map(|record| record.to_value())
                        .collect()
                }
            };
            emit_json(&Value::Array(records));
            Ok(())
        }
        Command::Completion { shell } => {
            let mut command = Cli::command();
            clap_complete::generate(shell, &mut command, "patient-query", &mut io::stdout());
            Ok(())
        }
    }
}

fn remote_hint(client: &RemoteClient, err: Error) -> Error {
    if err.kind() == ErrorKind::Io && err.hint().is_none() {
        let hint = format!("Check that a server is listening at {}.", client.base_url());
        err.with_hint(hint)
    } else {
        err
    }
}

fn load_store(path: &std::path::Path) -> Result<Store, Error> {
    api::load(path).map_err(|err| match err.kind() {
        ErrorKind::Io if err.hint().is_none() => err
            .with_hint("Pass --data <PATH> pointing at a patients JSON file."),
        _ => err,
    })
}

fn emit_json(value: &Value) {
    let json = if io::stdout().is_terminal() {
        serde_json::to_string_pretty(value)
    } else {
        serde_json::to_string(value)
    };
    println!(
        "{}",
        json.unwrap_or_else(|_| "{\"error\":\"json encode failed\"}".to_string())
    );
}

fn emit_error(err: &Error, color_mode: ColorMode) {
    let is_tty = io::stderr().is_terminal();
    if is_tty {
        eprintln!("{}", error_text(err, color_mode.use_color(is_tty)));
        return;
    }

    let json = serde_json::to_string(&error_json(err)).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_message(err: &Error) -> String {
    if let Some(message) = err.message() {
        return message.to_string();
    }
    match err.kind() {
        ErrorKind::Internal => "internal error".to_string(),
        ErrorKind::Usage => "usage error".to_string(),
        ErrorKind::NotFound => "not found".to_string(),
        ErrorKind::InvalidSortField => "invalid sort field".to_string(),
        ErrorKind::InvalidOrder => "invalid order".to_string(),
        ErrorKind::NoMatch => "no match".to_string(),
        ErrorKind::Io => "i/o error".to_string(),
        ErrorKind::Corrupt => "corrupt data".to_string(),
    }
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut cur = err.source();
    while let Some(source) = cur {
        causes.push(source.to_string());
        cur = source.source();
    }
    causes
}

fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), json!(hint));
    }
    if let Some(path) = err.path() {
        inner.insert("path".to_string(), json!(path.display().to_string()));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }

    let mut outer = Map::new();
    outer.insert("error".to_string(), Value::Object(inner));
    Value::Object(outer)
}

#[derive(Copy, Clone, Debug)]
enum AnsiColor {
    Red,
    Yellow,
}

fn colorize_label(label: &str, enabled: bool, color: AnsiColor) -> String {
    if !enabled {
        return label.to_string();
    }
    let code = match color {
        AnsiColor::Red => "31",
        AnsiColor::Yellow => "33",
    };
    format!("\x1b[1;{code}m{label}\x1b[0m")
}

fn error_text(err: &Error, use_color: bool) -> String {
    let mut lines = vec![format!(
        "{} {}",
        colorize_label("error:", use_color, AnsiColor::Red),
        error_message(err)
    )];
    if let Some(hint) = err.hint() {
        lines.push(format!(
            "{} {hint}",
            colorize_label("hint:", use_color, AnsiColor::Yellow)
        ));
    }
    if let Some(path) = err.path() {
        lines.push(format!(
            "{} {}",
            colorize_label("path:", use_color, AnsiColor::Yellow),
            path.display()
        ));
    }
    if let Some(cause) = error_causes(err).first() {
        lines.push(format!(
            "{} {cause}",
            colorize_label("caused by:", use_color, AnsiColor::Yellow)
        ));
    }
    lines.join("\n")
}

fn clap_error_summary(err: &clap::Error) -> String {
    for line in err.to_string().lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("error:") {
            return rest.trim().to_string();
        }
        return trimmed.to_string();
    }
    "invalid arguments".to_string()
}
