use clap::{Parser, Subcommand, ValueEnum};
use pruvious::query_string::parse_where;
use pruvious::schema::NestedFields;
use pruvious::{
    parse_raw_query, stringify_where, Engine, EngineConfig, QueryFailure, Record, Schema, SqliteStore,
};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

/// Pruvious CLI: query and validate records of a schema-described SQLite database
#[derive(Parser)]
#[command(name = "pruvious", version, about)]
struct Cli {
    /// Path to the collection schema (YAML)
    #[arg(long, default_value = "schema.yaml")]
    schema: PathBuf,

    /// Path to the SQLite database
    #[arg(long, default_value = "pruvious.db")]
    database: PathBuf,

    /// Engine settings (YAML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "yaml")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    Yaml,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Read records of a multi-entry collection
    Query {
        /// Collection name
        collection: String,
        /// URL query string (e.g. "where=price[gt][10]&order=price:desc&limit=5")
        #[arg(long, default_value = "")]
        query: String,
        /// Print the number of matching records instead of the records
        #[arg(long)]
        count: bool,
    },

    /// Create a record
    Create {
        /// Collection name
        collection: String,
        /// Field values (e.g. --field name="Desk lamp")
        #[arg(long = "field", value_parser = parse_key_value)]
        fields: Vec<(String, String)>,
    },

    /// Update every record matching a query string
    Update {
        /// Collection name
        collection: String,
        /// URL query string selecting the records
        #[arg(long)]
        query: String,
        /// Field values to update
        #[arg(long = "field", value_parser = parse_key_value)]
        fields: Vec<(String, String)>,
    },

    /// Delete every record matching a query string
    Delete {
        /// Collection name
        collection: String,
        /// URL query string selecting the records
        #[arg(long)]
        query: String,
    },

    /// Read a single-entry collection
    Read {
        /// Collection name
        collection: String,
        /// Language code (default: the primary language)
        #[arg(long)]
        language: Option<String>,
        /// Replace related ids with records
        #[arg(long)]
        populate: bool,
    },

    /// Update a single-entry collection
    Write {
        /// Collection name
        collection: String,
        /// Language code (default: the primary language)
        #[arg(long)]
        language: Option<String>,
        /// Field values to update
        #[arg(long = "field", value_parser = parse_key_value)]
        fields: Vec<(String, String)>,
    },

    /// Show the resolved schema
    Schema {
        /// Only show one collection
        collection: Option<String>,
    },

    /// Parse a where expression and print the filter tree
    ParseWhere {
        /// Collection name
        collection: String,
        /// Expression (e.g. "some:[price[lt][5],name[like][%lamp%]]")
        expression: String,
    },
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("Invalid key=value pair: no '=' found in '{s}'"))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("ERROR:{e}");
        process::exit(1);
    }
}

fn open_engine(cli: &Cli) -> Result<Engine, Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .map_err(|e| format!("Failed to read config '{}': {e}", path.display()))?;
            EngineConfig::from_yaml(&content)?
        }
        None => EngineConfig::default(),
    };
    // Keywords must be written before the process exits.
    config.reindex_in_background = false;

    let schema = Arc::new(Schema::load(&cli.schema, config)?);
    let store = SqliteStore::open(&cli.database)?;
    store.sync_schema(&schema)?;
    log::debug!("Opened {} with schema {}", cli.database.display(), cli.schema.display());
    Ok(Engine::new(schema, Arc::new(store)))
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    if let Command::Schema { collection } = &cli.command {
        let schema = Schema::load(&cli.schema, EngineConfig::default())?;
        let collections: Vec<Value> = schema
            .collections()
            .filter(|c| collection.as_ref().map_or(true, |name| &c.name == name))
            .map(|c| {
                json!({
                    "name": c.name,
                    "mode": c.mode,
                    "table": c.table,
                    "translatable": c.translatable,
                    "fields": c.fields.iter().map(describe_field).collect::<Vec<_>>(),
                    "search": c.search.iter().map(|s| json!({ "name": s.name, "fields": s.fields })).collect::<Vec<_>>(),
                })
            })
            .collect();
        return print_output(&json!(collections), &cli.format);
    }

    let engine = open_engine(&cli)?;

    match &cli.command {
        Command::Query {
            collection,
            query,
            count,
        } => {
            let mut builder = engine.query(collection)?;
            let parsed = parse_raw_query(builder.collection(), query);
            report_errors(&parsed.errors)?;
            builder.apply_query_string(&parsed);
            if *count {
                let total = finish(&cli, builder.count())?;
                print_output(&json!({ "count": total }), &cli.format)?;
            } else {
                let records = finish(&cli, builder.all())?;
                print_output(&json!(records), &cli.format)?;
            }
        }

        Command::Create { collection, fields } => {
            let builder = engine.query(collection)?;
            let record = finish(&cli, builder.create(&fields_to_record(fields)))?;
            print_output(&Value::Object(record), &cli.format)?;
        }

        Command::Update {
            collection,
            query,
            fields,
        } => {
            let mut builder = engine.query(collection)?;
            let parsed = parse_raw_query(builder.collection(), query);
            report_errors(&parsed.errors)?;
            builder.apply_query_string(&parsed);
            let records = finish(&cli, builder.update(&fields_to_record(fields)))?;
            print_output(&json!(records), &cli.format)?;
        }

        Command::Delete { collection, query } => {
            let mut builder = engine.query(collection)?;
            let parsed = parse_raw_query(builder.collection(), query);
            report_errors(&parsed.errors)?;
            builder.apply_query_string(&parsed);
            let records = finish(&cli, builder.delete())?;
            print_output(&json!({ "deleted": records.len(), "records": records }), &cli.format)?;
        }

        Command::Read {
            collection,
            language,
            populate,
        } => {
            let mut builder = engine.single(collection)?;
            if let Some(language) = language {
                builder.language(language);
            }
            if *populate {
                builder.populate();
            }
            let record = finish(&cli, builder.read())?;
            print_output(&Value::Object(record), &cli.format)?;
        }

        Command::Write {
            collection,
            language,
            fields,
        } => {
            let mut builder = engine.single(collection)?;
            if let Some(language) = language {
                builder.language(language);
            }
            let record = finish(&cli, builder.update(&fields_to_record(fields)))?;
            print_output(&Value::Object(record), &cli.format)?;
        }

        Command::ParseWhere {
            collection,
            expression,
        } => {
            let resolved = engine.schema().collection(collection)?;
            let mut errors = Vec::new();
            let nodes = parse_where(resolved, expression, &mut errors);
            print_output(
                &json!({
                    "where": nodes.iter().map(|n| n.to_json()).collect::<Vec<_>>(),
                    "normalized": stringify_where(&nodes),
                    "errors": errors,
                }),
                &cli.format,
            )?;
        }

        Command::Schema { .. } => {}
    }

    Ok(())
}

/// Print a failure body and turn it into an error for the exit code.
fn finish<T>(cli: &Cli, result: Result<T, QueryFailure>) -> Result<T, Box<dyn std::error::Error>> {
    match result {
        Ok(value) => Ok(value),
        Err(failure) => {
            print_output(&failure.to_json(), &cli.format)?;
            Err(failure.into())
        }
    }
}

fn report_errors(errors: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    if errors.is_empty() {
        return Ok(());
    }
    Err(errors.join("; ").into())
}

fn describe_field(field: &pruvious::schema::ResolvedField) -> Value {
    let mut described = json!({
        "name": field.name,
        "type": field.field_type,
        "column": field.column,
        "required": field.required,
        "unique": field.unique,
        "translatable": field.translatable,
    });
    match &field.nested {
        NestedFields::None => {}
        NestedFields::Repeater(subfields) => {
            described["subfields"] = json!(subfields.iter().map(describe_field).collect::<Vec<_>>());
        }
        NestedFields::Blocks(allowed) => described["blocks"] = json!(allowed),
    }
    described
}

fn print_output(value: &Value, format: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Yaml => print!("{}", serde_yaml::to_string(value)?),
    }
    Ok(())
}

fn fields_to_record(fields: &[(String, String)]) -> Record {
    let mut record = Record::new();
    for (key, val) in fields {
        // Numbers, booleans, arrays and objects are given as JSON
        let value = serde_json::from_str(val).unwrap_or_else(|_| Value::String(val.clone()));
        record.insert(key.clone(), value);
    }
    record
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCHEMA: &str = r#"
blocks:
  hero:
    fields:
      title: { type: text }
collections:
  pages:
    fields:
      links:
        type: repeater
        options:
          subfields:
            url: { type: text }
      content: { type: blocks, options: { allowedBlocks: [hero] } }
"#;

    #[test]
    fn test_describe_field_lists_nested_structure() {
        let schema = Schema::from_yaml(SCHEMA, EngineConfig::default()).unwrap();
        let pages = schema.collection("pages").unwrap();

        let content = describe_field(pages.field("content").unwrap());
        assert_eq!(content["blocks"], json!(["hero"]));
        assert!(content.get("subfields").is_none());

        let links = describe_field(pages.field("links").unwrap());
        assert_eq!(links["subfields"][0]["name"], json!("url"));
    }

    #[test]
    fn test_parse_key_value() {
        assert_eq!(parse_key_value("name=a=b").unwrap(), ("name".to_string(), "a=b".to_string()));
        assert!(parse_key_value("name").is_err());
    }
}
