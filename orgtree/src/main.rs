use std::{fs, path::PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use orgtree::core::{Document, TodoGroups};
use orgtree::parser::ParseOptions;
use orgtree::settings::todo_groups;
use orgtree::storage::{FsLoader, OrgLoader, discover};
use orgtree::tokens::{TokenWithMeta, tokenize_str};

#[derive(Debug, Parser)]
#[command(
    name = "orgtree",
    about = "Parse Org documents into a structured tree",
    version
)]
struct Cli {
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    /// Default TODO keywords for files without a `#+TODO:` line, e.g. "TODO NEXT | DONE".
    #[arg(long, global = true)]
    todo: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Parse Org files and print the document tree.
    Parse(InputArgs),

    /// Print the token stream of Org files.
    Tokens(InputArgs),

    /// Print the headline outline of Org files.
    Outline(OutlineArgs),
}

#[derive(Debug, Args)]
struct InputArgs {
    /// Org files or directories containing Org files.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Emit JSON instead of a debug representation.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct OutlineArgs {
    /// Org files or directories containing Org files.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let options = parse_options(cli.todo.as_deref());
    match cli.command {
        Commands::Parse(args) => handle_parse(args, options),
        Commands::Tokens(args) => handle_tokens(args),
        Commands::Outline(args) => handle_outline(args, options),
    }
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp(None)
        .init();
}

fn parse_options(todo: Option<&str>) -> ParseOptions {
    let mut options = ParseOptions::default();
    if let Some(value) = todo {
        let groups: TodoGroups = todo_groups(value);
        log::debug!("default TODO groups from command line: {:?}", groups);
        options.default_todos = groups;
    }
    options
}

fn load_all(inputs: &[PathBuf], options: ParseOptions) -> Result<Vec<(PathBuf, Document)>> {
    let paths = discover(inputs)?;
    if paths.is_empty() {
        anyhow::bail!("no Org files found in the provided inputs");
    }
    log::debug!("Parsing {} Org files", paths.len());
    FsLoader::new(options).load_all(&paths)
}

fn handle_parse(args: InputArgs, options: ParseOptions) -> Result<()> {
    let InputArgs { inputs, json } = args;
    let parsed = load_all(&inputs, options)?;

    if json {
        #[derive(serde::Serialize)]
        struct JsonOutput<'a> {
            path: String,
            document: &'a Document,
        }

        let payload: Vec<JsonOutput<'_>> = parsed
            .iter()
            .map(|(path, document)| JsonOutput {
                path: path.display().to_string(),
                document,
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        print_each(&parsed, |doc| format!("{:#?}", doc));
    }
    Ok(())
}

fn handle_tokens(args: InputArgs) -> Result<()> {
    let InputArgs { inputs, json } = args;
    let paths = discover(&inputs)?;
    if paths.is_empty() {
        anyhow::bail!("no Org files found in the provided inputs");
    }

    let mut streams = Vec::new();
    for path in paths {
        let text = fs::read_to_string(&path).with_context(|| format!("reading {:?}", path))?;
        streams.push((path, tokenize_str(&text)));
    }

    if json {
        #[derive(serde::Serialize)]
        struct JsonOutput<'a> {
            path: String,
            tokens: &'a [TokenWithMeta],
        }

        let payload: Vec<JsonOutput<'_>> = streams
            .iter()
            .map(|(path, tokens)| JsonOutput {
                path: path.display().to_string(),
                tokens,
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        print_each(&streams, |tokens| {
            tokens
                .iter()
                .map(|t| format!("{:>5}: {:?}", t.meta.line, t.token))
                .collect::<Vec<_>>()
                .join("\n")
        });
    }
    Ok(())
}

fn handle_outline(args: OutlineArgs, options: ParseOptions) -> Result<()> {
    let parsed = load_all(&args.inputs, options)?;
    print_each(&parsed, |doc| {
        let mut out = String::new();
        if let Some(title) = doc.title() {
            out.push_str(&format!("#+TITLE: {}\n", title));
        }
        out.push_str(&orgtree::outline(doc));
        out.trim_end().to_string()
    });
    Ok(())
}

fn print_each<T>(items: &[(PathBuf, T)], render: impl Fn(&T) -> String) {
    for (idx, (path, item)) in items.iter().enumerate() {
        if items.len() > 1 {
            println!("== {} ==", path.display());
        }
        println!("{}", render(item));
        if items.len() > 1 && idx + 1 < items.len() {
            println!();
        }
    }
}
