//! bee-coordinator 命令行
//!
//! ```bash
//! # 推导请求的产物契约，并用给定文件作为证据评估（--text=<file> 指定最终输出文本）
//! bee-coordinator contract "请帮我制作PPT并导出pptx" out.md
//!
//! # 加载并校验工具链定义（默认读取配置中的 [chains].dir）
//! bee-coordinator chains config/chains
//! ```

use std::sync::Arc;

use anyhow::Context;
use bee_coordinator::chain::ChainRegistry;
use bee_coordinator::config::load_config;
use bee_coordinator::core::CoordinatorBuilder;
use bee_coordinator::contract::{build_contract, detect_degraded_outputs, evaluate, ArtifactEvidence};
use bee_coordinator::tools::ToolRegistry;

const USAGE: &str = "usage:\n  bee-coordinator contract <query> [files...] [--text=<file>]\n  bee-coordinator chains [dir]";

fn run_contract(args: &[String]) -> anyhow::Result<()> {
    let (query, rest) = args.split_first().context(USAGE)?;

    let mut evidence = ArtifactEvidence::new();
    for arg in rest {
        match arg.strip_prefix("--text=") {
            Some(path) => {
                evidence.output_text = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read output text from {}", path))?;
            }
            None => evidence.record_file(arg),
        }
    }

    let contract = build_contract(query);
    let evaluation = evaluate(&contract, &evidence);
    let degraded = detect_degraded_outputs(&contract, &evidence.files);
    tracing::info!(
        requirements = contract.requirements.len(),
        passed = evaluation.passed,
        "contract evaluated"
    );

    let report = serde_json::json!({
        "contract": contract,
        "evaluation": evaluation,
        "degraded": degraded,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn run_chains(args: &[String]) -> anyhow::Result<()> {
    let mut config = load_config(None).context("Failed to load config")?;
    if let Some(dir) = args.first() {
        config.chains.dir = dir.into();
    }
    let dir = config.chains.dir.clone();

    let runtime = CoordinatorBuilder::new(config).build(Arc::new(ToolRegistry::new()));
    let registry: ChainRegistry = runtime
        .load_chains()
        .with_context(|| format!("Failed to load chains from {}", dir.display()))?;
    println!("{} chain(s) in {}", registry.ids().len(), dir.display());
    for id in registry.ids() {
        let chain = registry.get(&id)?;
        let tools: Vec<&str> = chain.steps.iter().map(|s| s.tool.as_str()).collect();
        println!("  {:<24} {} step(s): {}", id, chain.steps.len(), tools.join(" -> "));
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    bee_coordinator::observability::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.split_first() {
        Some((cmd, rest)) if cmd == "contract" => run_contract(rest),
        Some((cmd, rest)) if cmd == "chains" => run_chains(rest),
        _ => {
            eprintln!("{}", USAGE);
            std::process::exit(2);
        }
    }
}
