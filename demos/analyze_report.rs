use dotenv::dotenv;
use financial_report_analyzer::{
    AnalysisEvent, AnalysisPipeline, AnthropicClient, PipelineConfig, PointValue, TemplateStore,
};
use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;

// Used when no document path is given on the command line.
const MOCK_ANNUAL_REPORT: &str = r#"
ACME Retail Corporation
Annual Report - Year Ended Dec 31, 2023

Revenue for the year was $3.5 million, up from $2.8 million in 2022.
Net income came in at $0.42 million. Operating cash flow was $0.61 million.

BALANCE SHEET (As of Dec 31, 2023)
Total assets: $1.32 million
Total liabilities: $0.74 million
Current assets of $0.87 million against current liabilities of $0.52 million;
inventory accounts for $0.68 million of current assets.

The company depends on two suppliers for 70% of its stock and carries a
$450,000 bank loan maturing in 2025.
"#;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    dotenv().ok();

    // 1. Pick the document and template
    let mut args = std::env::args().skip(1);
    let template_id = args.next().unwrap_or_else(|| "financial".to_string());
    let document = match args.next().map(PathBuf::from) {
        Some(path) => std::fs::read_to_string(&path)?,
        None => MOCK_ANNUAL_REPORT.to_string(),
    };

    // 2. Build the pipeline
    let mut templates = TemplateStore::builtin();
    if let Ok(dir) = std::env::var("ANALYZER_TEMPLATE_DIR") {
        let loaded = templates.load_dir(Path::new(&dir))?;
        println!("📂 Loaded {} custom template(s) from {}", loaded, dir);
    }
    for (id, reason) in templates.rejected() {
        eprintln!("⚠️  Template '{}' rejected: {}", id, reason);
    }

    let pipeline = AnalysisPipeline::new(
        Arc::new(templates),
        Arc::new(AnthropicClient::from_env()?),
        PipelineConfig::from_env()?,
    );

    // 3. Analyze with progress reporting
    let session = pipeline.upload(&document).await?;
    println!("🚀 Analyzing session {} with template '{}'...", session, template_id);

    let (tx, mut rx) = mpsc::channel(16);
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                AnalysisEvent::AwaitingModel => println!("   ⏳ Waiting for the model..."),
                AnalysisEvent::Incomplete { missing_fields } => {
                    println!("   ⚠️  Missing: {}", missing_fields.join(", "))
                }
                AnalysisEvent::Failed { reason } => println!("   ❌ {}", reason),
                other => println!("   • {:?}", other),
            }
        }
    });

    let report = pipeline
        .analyze_with_progress(&session, &template_id, Some(tx))
        .await;
    printer.await?;
    let report = report?;

    // 4. Show the result
    println!("\n📋 Structured analysis:");
    println!("{}", serde_json::to_string_pretty(&report.result.data)?);

    if report.is_incomplete() {
        println!(
            "\n⚠️  Incomplete sections: {}",
            report.missing_sections().join(", ")
        );
    }

    println!("\n📊 Charts:");
    for chart in &report.charts {
        println!("  {} ({})", chart.title, chart.chart_type.as_str());
        for point in &chart.points {
            let value = match &point.value {
                PointValue::Number(n) => format!("{:.2}", n),
                PointValue::Date(d) => d.to_string(),
            };
            println!(
                "    {:<24} {} {}",
                point.label,
                value,
                chart.unit.as_deref().unwrap_or("")
            );
        }
    }
    for skipped in &report.skipped {
        println!("  ⏭️  {} skipped: {}", skipped.name, skipped.reason);
    }

    pipeline.shutdown().await?;
    Ok(())
}
