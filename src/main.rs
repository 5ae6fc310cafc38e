use std::path::Path;

use clap::Parser;
use colbertdb::{
    ColbertEngine,
    DataDir,
    Document,
    DocumentId,
    IndexConfig,
    IndexController,
    ModelManager,
    SearchOptions,
    cli::{
        AddArgs,
        Cli,
        Command,
        CreateArgs,
        DeleteArgs,
        RerankArgs,
        SearchArgs,
    },
    error::{Error, Result},
    lifecycle::SearchReport,
    model_manager::resolve_model_id,
    reranker::{self, RerankOptions},
};
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if let Ok(env) = std::env::var("COLBERTDB_LOG") {
        EnvFilter::new(env)
    } else if quiet {
        EnvFilter::new("warn")
    } else {
        match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

type Controller = IndexController<ColbertEngine>;

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    if let Command::Completions(args) = &cli.command {
        args.generate();
        return Ok(());
    }

    let model_id = resolve_model_id(cli.model.as_deref());

    if let Command::Rerank(args) = &cli.command {
        return cmd_rerank(ModelManager::with_model_id(model_id), args);
    }

    let data_dir = DataDir::resolve(cli.data_dir.as_deref())?;
    let config = IndexConfig {
        store: cli.store.clone(),
        ..IndexConfig::default()
    };
    let engine = ColbertEngine::new(ModelManager::with_model_id(model_id.clone()))
        .with_progress(!cli.quiet);
    let controller = IndexController::new(engine, data_dir, model_id, config);

    match cli.command {
        Command::Create(args) => cmd_create(&controller, &args)?,
        Command::Add(args) => cmd_add(&controller, &args)?,
        Command::DeleteDocs(args) => cmd_delete(&controller, &args)?,
        Command::Search(args) => cmd_search(&controller, &args)?,
        Command::Drop(args) => {
            if controller.destroy(&args.name)? {
                println!("Dropped index '{}'", args.name);
            } else {
                println!("Index '{}' does not exist", args.name);
            }
        }
        Command::List(args) => {
            let names = controller.list_indexes()?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&names)?);
            } else if names.is_empty() {
                println!("No indexes in store '{}'", controller.config().store);
            } else {
                for name in names {
                    println!("{name}");
                }
            }
        }
        Command::Status(args) => {
            controller.load(&args.name)?;
            let Some(status) = controller.status()? else {
                return Err(Error::NotFound {
                    kind: "index",
                    name: args.name,
                });
            };
            if args.json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                println!("Index:      {}", status.index_name);
                println!("State:      {}", status.phase.as_str());
                println!("Model:      {}", status.checkpoint);
                println!("Passages:   {}", status.passages);
                println!("Documents:  {}", status.documents);
                println!("nbits:      {}", status.nbits);
                match status.metadata_entries {
                    Some(n) => println!("Metadata:   {n} documents"),
                    None => println!("Metadata:   not tracked"),
                }
            }
        }
        Command::Rerank(_) | Command::Completions(_) => {}
    }

    Ok(())
}

/// One input document: either bare text or a full object.
#[derive(Deserialize)]
#[serde(untagged)]
enum DocumentInput {
    Text(String),
    Full(Document),
}

impl From<DocumentInput> for Document {
    fn from(input: DocumentInput) -> Self {
        match input {
            DocumentInput::Text(content) => Document {
                id: None,
                content,
                metadata: None,
            },
            DocumentInput::Full(doc) => doc,
        }
    }
}

fn read_input(path: Option<&Path>) -> Result<String> {
    match path {
        Some(path) => std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read {}: {e}", path.display()))
        }),
        None => Ok(std::io::read_to_string(std::io::stdin())?),
    }
}

fn read_documents(path: Option<&Path>) -> Result<Vec<Document>> {
    let inputs: Vec<DocumentInput> = serde_json::from_str(&read_input(path)?)?;
    Ok(inputs.into_iter().map(Document::from).collect())
}

fn parse_ids(raw: &[String], integer: bool) -> Result<Vec<DocumentId>> {
    raw.iter()
        .map(|id| {
            if integer {
                id.parse::<i64>().map(DocumentId::Integer).map_err(|_| {
                    Error::Validation(format!("'{id}' is not an integer document id"))
                })
            } else {
                Ok(DocumentId::String(id.clone()))
            }
        })
        .collect()
}

fn cmd_create(controller: &Controller, args: &CreateArgs) -> Result<()> {
    let documents = read_documents(args.input.as_deref())?;
    let report =
        controller.create_from_documents(&args.name, documents, args.overwrite.into())?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "Built index '{}': {} passages from {} documents (nbits {})",
            report.index_name, report.passages, report.documents, report.nbits
        );
    }
    Ok(())
}

fn cmd_add(controller: &Controller, args: &AddArgs) -> Result<()> {
    let documents = read_documents(args.input.as_deref())?;
    controller.load(&args.name)?;
    let report = controller.add_documents(documents)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        match report.strategy {
            Some(strategy) => println!(
                "Added {} passages to '{}' ({:?}), {} total",
                report.added_passages, args.name, strategy, report.total_passages
            ),
            None => println!("Nothing new to add to '{}'", args.name),
        }
        if !report.skipped_documents.is_empty() {
            println!(
                "Skipped {} documents already in the index",
                report.skipped_documents.len()
            );
        }
    }
    Ok(())
}

fn cmd_delete(controller: &Controller, args: &DeleteArgs) -> Result<()> {
    let ids = parse_ids(&args.ids, args.integer_ids)?;
    let Some(report) = controller.delete(Some(&args.name), &ids)? else {
        return Ok(());
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "Removed {} passages of {} documents, {} remaining",
            report.removed_passages,
            report.removed_documents.len(),
            report.total_passages
        );
        for id in &report.unknown_documents {
            println!("  not in index: {id}");
        }
    }
    Ok(())
}

fn cmd_search(controller: &Controller, args: &SearchArgs) -> Result<()> {
    let filter = if args.doc_ids.is_empty() {
        None
    } else {
        Some(parse_ids(&args.doc_ids, args.integer_ids)?)
    };
    let options = SearchOptions {
        index_name: Some(args.name.clone()),
        k: args.count,
        fast: args.fast,
        zero_index_ranks: args.zero_index,
        filter,
    };

    let reports = if let [query] = args.queries.as_slice() {
        controller.search(query, &options)?.map(|r| vec![r])
    } else {
        controller.search_batch(&args.queries, &options)?
    };
    let reports = reports.unwrap_or_default();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
        return Ok(());
    }
    for (query, report) in args.queries.iter().zip(&reports) {
        if reports.len() > 1 {
            println!("# {query}");
        }
        format_human(report);
    }
    Ok(())
}

fn format_human(report: &SearchReport) {
    if report.hits.is_empty() {
        println!("No results.");
        return;
    }
    for hit in &report.hits {
        println!(
            "{:>3}. {:.3}  [{}] {}",
            hit.rank,
            hit.score,
            hit.document_id,
            first_line(&hit.content)
        );
    }
}

fn first_line(content: &str) -> &str {
    content.lines().next().unwrap_or_default()
}

fn cmd_rerank(mut model: ModelManager, args: &RerankArgs) -> Result<()> {
    let documents: Vec<String> = serde_json::from_str(&read_input(args.input.as_deref())?)?;
    let config = IndexConfig::default();
    let report = reranker::rerank(
        &mut model,
        &args.query,
        &documents,
        RerankOptions {
            k: args.count,
            zero_index_ranks: args.zero_index,
            min_query_length: config.min_query_length,
            max_tokens: config.base_model_max_tokens,
            batch_size: config.index_batch_size,
        },
    )?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for hit in &report.hits {
            println!(
                "{:>3}. {:.3}  #{} {}",
                hit.rank,
                hit.score,
                hit.result_index,
                first_line(&hit.content)
            );
        }
    }
    Ok(())
}
