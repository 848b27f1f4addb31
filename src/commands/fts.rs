//! Full-text search command implementation.

use std::io::Read;

use anyhow::{bail, Context, Result};
use clap::Subcommand;
use greener::fts::{doc_ids, order_facets_by_names, Facet, FacetCount, Fts};
use greener::Db;
use serde::Serialize;

use crate::OutputFormat;

#[derive(Subcommand)]
pub enum FtsAction {
    /// Store a document (content from the argument or stdin)
    Put {
        docid: String,
        content: Option<String>,
        /// Facets as name=value, repeatable
        #[arg(long = "facet")]
        facets: Vec<String>,
    },
    /// Print a document
    Get { docid: String },
    /// Remove a document
    Delete { docid: String },
    /// Search documents and summarise their facets
    Search {
        query: String,
        /// Facet names to list first
        #[arg(long = "order")]
        order: Vec<String>,
    },
    /// Attach facets (name=value) to a document
    Facet {
        docid: String,
        #[arg(required = true)]
        facets: Vec<String>,
    },
}

#[derive(Serialize)]
struct SearchOutput {
    hits: Vec<greener::fts::SearchHit>,
    facets: Vec<FacetCount>,
}

fn parse_facet(raw: &str) -> Result<Facet> {
    match raw.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok(Facet::new(name, value)),
        _ => bail!("facet must look like name=value, got {:?}", raw),
    }
}

fn parse_facets(raw: &[String]) -> Result<Vec<Facet>> {
    raw.iter().map(|f| parse_facet(f)).collect()
}

pub async fn run(db: &Db, action: FtsAction, format: OutputFormat) -> Result<()> {
    let fts = Fts::new(db.clone())
        .await
        .context("failed to prepare search tables")?;

    match action {
        FtsAction::Put {
            docid,
            content,
            facets,
        } => {
            let facets = parse_facets(&facets)?;
            let content = match content {
                Some(content) => content,
                None => {
                    let mut buf = String::new();
                    std::io::stdin()
                        .read_to_string(&mut buf)
                        .context("failed to read content from stdin")?;
                    buf
                }
            };
            fts.put(&docid, &content).await?;
            fts.add_facets(&docid, &facets).await?;
            report(format, "put", &docid);
        }
        FtsAction::Get { docid } => {
            let content = fts.get(&docid)?;
            match format {
                OutputFormat::Text => println!("{}", content),
                OutputFormat::Json => println!(
                    "{}",
                    serde_json::json!({ "docid": docid, "content": content })
                ),
            }
        }
        FtsAction::Delete { docid } => {
            fts.delete(&docid).await?;
            report(format, "deleted", &docid);
        }
        FtsAction::Search { query, order } => {
            let hits = fts.search(&query)?;
            let counts = fts.facet_counts(&doc_ids(&hits))?;
            let order: Vec<&str> = order.iter().map(String::as_str).collect();
            let output = SearchOutput {
                hits,
                facets: order_facets_by_names(&counts, &order),
            };

            match format {
                OutputFormat::Text => {
                    if output.hits.is_empty() {
                        println!("No matches.");
                    } else {
                        for hit in &output.hits {
                            println!("{:<20} {}", hit.docid, hit.snippet);
                        }
                        for facet in &output.facets {
                            println!();
                            println!("{}", facet.name);
                            for value in &facet.values {
                                println!("  {:<30} {:>6}", value.value, value.count);
                            }
                        }
                    }
                }
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&output)?),
            }
        }
        FtsAction::Facet { docid, facets } => {
            fts.add_facets(&docid, &parse_facets(&facets)?).await?;
            report(format, "tagged", &docid);
        }
    }

    Ok(())
}

fn report(format: OutputFormat, action: &str, docid: &str) {
    match format {
        OutputFormat::Text => println!("{} {}", action, docid),
        OutputFormat::Json => println!(
            "{}",
            serde_json::json!({ "action": action, "docid": docid })
        ),
    }
}
