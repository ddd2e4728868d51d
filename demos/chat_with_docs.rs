use dotenv::dotenv;
use financial_report_analyzer::{AnalysisPipeline, AnthropicClient, PipelineConfig, TemplateStore};
use std::error::Error;
use std::io::{self, Write};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    dotenv().ok();

    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("DOCUMENT_PATH").ok())
        .ok_or("pass a document path or set DOCUMENT_PATH")?;
    let document = std::fs::read_to_string(&path)?;

    println!("💬 Starting Document Chat...\n");

    let pipeline = AnalysisPipeline::new(
        Arc::new(TemplateStore::builtin()),
        Arc::new(AnthropicClient::from_env()?),
        PipelineConfig::from_env()?,
    );
    let session = pipeline.upload(&document).await?;
    println!("✅ Loaded {} ({} characters).\n", path, document.chars().count());

    println!("🤖 Ready! Ask questions about your document.");
    println!("   ':analyze <template>' runs a structured analysis first; 'quit' exits.");
    println!("------------------------------------------------------------------");

    loop {
        print!("> ");
        io::stdout().flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;
        let prompt = input.trim();

        if prompt.eq_ignore_ascii_case("quit") || prompt.eq_ignore_ascii_case("exit") {
            break;
        }

        if prompt.is_empty() {
            continue;
        }

        if let Some(template_id) = prompt.strip_prefix(":analyze") {
            let template_id = template_id.trim();
            match pipeline.analyze(&session, template_id).await {
                Ok(report) => println!(
                    "\n📋 Analysis attached: {} chart(s), {} skipped, incomplete: {}\n",
                    report.charts.len(),
                    report.skipped.len(),
                    report.is_incomplete()
                ),
                Err(e) => eprintln!("❌ Error: {}", e),
            }
            continue;
        }

        println!("\nThinking...");

        match pipeline.ask(&session, prompt).await {
            Ok(response) => {
                println!("\n{}\n", response);
                println!("------------------------------------------------------------------");
            }
            Err(e) => {
                eprintln!("❌ Error: {}", e);
            }
        }
    }

    pipeline.shutdown().await?;
    Ok(())
}
