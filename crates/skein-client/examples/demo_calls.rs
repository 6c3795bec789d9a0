//! Demo of recorded ops simulating a retrieve -> rerank -> answer flow.
//!
//! Calls are written to a local JSONL call log, then read back and printed
//! as a tree.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use skein_client::{
    Client, ClientConfig, FileTransport, LoggingConfig, Op, init_logging, with_attributes,
};
use skein_trace::{CallLogWriter, CallNode, CallTree, WriterConfig};

#[derive(Debug, Clone, Serialize)]
struct Passage {
    source: String,
    score: f64,
}

fn retrieve() -> Op<String, Vec<Passage>, String> {
    Op::builder("retrieve")
        .description("Look up candidate passages")
        .build(|query: String| async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(vec![
                Passage {
                    source: format!("docs/{}.md", query.replace(' ', "_")),
                    score: 0.4,
                },
                Passage {
                    source: "src/engine.rs".to_string(),
                    score: 0.9,
                },
            ])
        })
}

fn rerank() -> Op<Vec<Passage>, Vec<Passage>, String> {
    Op::builder("rerank")
        .summarize(|output| {
            let mut summary = skein_client::Attributes::new();
            summary.insert("kept".to_string(), json!(output.as_array().map_or(0, Vec::len)));
            summary
        })
        .build_sync(|mut passages: Vec<Passage>| {
            passages.sort_by(|a, b| b.score.total_cmp(&a.score));
            passages.truncate(1);
            Ok(passages)
        })
}

fn answer(
    retrieve: Op<String, Vec<Passage>, String>,
    rerank: Op<Vec<Passage>, Vec<Passage>, String>,
) -> Op<String, String, String> {
    Op::builder("answer").build(move |query: String| {
        let retrieve = retrieve.clone();
        let rerank = rerank.clone();
        async move {
            let candidates = retrieve.call(query).await?;
            let best = rerank.call(candidates).await?;
            let top = best.first().ok_or_else(|| "no passages".to_string())?;
            Ok::<_, String>(format!("See {}", top.source))
        }
    })
}

fn print_node(node: &CallNode, depth: usize) {
    println!(
        "{}{} [{}] {}ms",
        "  ".repeat(depth),
        node.record.op_name,
        node.record.status,
        node.record.duration_ms().unwrap_or(0)
    );
    for child in &node.children {
        print_node(child, depth + 1);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging(&LoggingConfig::default())?;

    let log_file = std::env::temp_dir().join("skein-demo-calls.jsonl");
    let _ = std::fs::remove_file(&log_file);
    let transport = Arc::new(FileTransport::new(WriterConfig::session(&log_file))?);
    let client = Client::with_transport(ClientConfig::default(), transport)?;

    let answer = answer(retrieve(), rerank());
    let attributes = [("experiment".to_string(), json!("demo"))].into_iter().collect();

    let result = client
        .scope(with_attributes(
            attributes,
            answer.call("where is the engine".to_string()),
        ))
        .await?;
    let trials = client.scope(answer.trials(3, "engine".to_string())).await;
    client.shutdown().await?;

    println!("Answer: {}", result);
    println!("Trial success rate: {:.2}", trials.success_rate());

    let ops = CallLogWriter::read_ops(&log_file)?;
    let tree = CallTree::from_ops(&ops)?;
    println!("\n--- {} calls in {} ---", tree.len(), log_file.display());
    for root in &tree.roots {
        print_node(root, 0);
    }

    Ok(())
}
