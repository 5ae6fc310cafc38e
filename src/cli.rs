use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;

use crate::{data_dir::DEFAULT_STORE, engine::OverwritePolicy};

#[derive(Debug, Parser)]
#[command(
    name = "colbertdb",
    about = "Build, update and query late-interaction document indexes"
)]
pub struct Cli {
    /// Override the XDG data directory
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Override the ColBERT model ID or local model path
    #[arg(long, global = true)]
    pub model: Option<String>,

    /// Store (namespace) holding the indexes
    #[arg(long, global = true, default_value = DEFAULT_STORE)]
    pub store: String,

    /// Increase log verbosity (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Build a new index from a JSON list of documents
    Create(CreateArgs),
    /// Add documents to an existing index
    Add(AddArgs),
    /// Delete documents from an index by document id (experimental)
    DeleteDocs(DeleteArgs),
    /// Search an index
    Search(SearchArgs),
    /// Delete an index and all its files
    Drop(DropArgs),
    /// List the indexes of a store
    List(ListArgs),
    /// Show statistics of an index
    Status(StatusArgs),
    /// Rank a JSON list of texts against a query without an index
    Rerank(RerankArgs),
    /// Generate shell completions
    #[command(hide = true)]
    Completions(CompletionsArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum Overwrite {
    /// Keep existing embeddings and only encode what is missing
    Reuse,
    #[default]
    Overwrite,
    /// Overwrite without logging
    ForceSilent,
}

impl From<Overwrite> for OverwritePolicy {
    fn from(value: Overwrite) -> Self {
        match value {
            Overwrite::Reuse => OverwritePolicy::Reuse,
            Overwrite::Overwrite => OverwritePolicy::Overwrite,
            Overwrite::ForceSilent => OverwritePolicy::ForceSilentOverwrite,
        }
    }
}

// -- Create / Add --

#[derive(Debug, Parser)]
pub struct CreateArgs {
    /// Name of the index
    pub name: String,

    /// JSON file with documents (reads stdin when omitted)
    #[arg(short, long)]
    pub input: Option<PathBuf>,

    /// What to do with an existing index of the same name
    #[arg(long, value_enum, default_value_t = Overwrite::Overwrite)]
    pub overwrite: Overwrite,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct AddArgs {
    /// Name of the index
    pub name: String,

    /// JSON file with documents (reads stdin when omitted)
    #[arg(short, long)]
    pub input: Option<PathBuf>,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Delete --

#[derive(Debug, Parser)]
pub struct DeleteArgs {
    /// Name of the index
    pub name: String,

    /// Document ids to delete
    #[arg(required = true)]
    pub ids: Vec<String>,

    /// Treat the ids as integers
    #[arg(long)]
    pub integer_ids: bool,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Search --

#[derive(Debug, Parser)]
pub struct SearchArgs {
    /// Name of the index
    pub name: String,

    /// One or more queries; several queries run as a batch
    #[arg(required = true)]
    pub queries: Vec<String>,

    /// Number of results to return per query
    #[arg(short = 'n', long)]
    pub count: Option<usize>,

    /// Use the fastest, lowest-recall search settings
    #[arg(long)]
    pub fast: bool,

    /// Number ranks from zero
    #[arg(long)]
    pub zero_index: bool,

    /// Only return passages of these document ids
    #[arg(long = "doc-id")]
    pub doc_ids: Vec<String>,

    /// Treat --doc-id values as integers
    #[arg(long)]
    pub integer_ids: bool,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Drop / List / Status --

#[derive(Debug, Parser)]
pub struct DropArgs {
    /// Name of the index
    pub name: String,
}

#[derive(Debug, Parser)]
pub struct ListArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct StatusArgs {
    /// Name of the index
    pub name: String,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Rerank --

#[derive(Debug, Parser)]
pub struct RerankArgs {
    /// The query
    pub query: String,

    /// JSON file with a list of texts (reads stdin when omitted)
    #[arg(short, long)]
    pub input: Option<PathBuf>,

    /// Number of results to return
    #[arg(short = 'n', long, default_value = "10")]
    pub count: usize,

    /// Number ranks from zero
    #[arg(long)]
    pub zero_index: bool,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Completions --

#[derive(Debug, Parser)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    pub shell: Shell,
}

impl CompletionsArgs {
    /// Generate shell completions and print to stdout.
    pub fn generate(&self) {
        let mut cmd = Cli::command();
        clap_complete::generate(
            self.shell,
            &mut cmd,
            "colbertdb",
            &mut std::io::stdout(),
        );
    }
}
