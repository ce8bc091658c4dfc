// ABOUTME: `sandflow providers`: probe each provider backend and show its capabilities

use anyhow::Result;
use colored::*;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, ContentArrangement, Table};
use sandflow_cli::config::{build_provider, CliConfig, ProviderKind};
use sandflow_sandbox::ProviderStatus;

pub async fn providers_command() -> Result<()> {
    let config = CliConfig::resolve(None, None)?;

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Provider", "Version", "Status", "File transfer", "Ports"]);

    for kind in [ProviderKind::Local, ProviderKind::Docker] {
        let provider = match build_provider(kind, &config.docker_image, config.docker_pull_timeout) {
            Ok(provider) => provider,
            Err(e) => {
                table.add_row(vec![
                    kind.to_string(),
                    "-".to_string(),
                    format!("unavailable: {}", e),
                    "-".to_string(),
                    "-".to_string(),
                ]);
                continue;
            }
        };

        let row = match provider.info().await {
            Ok(info) => {
                let status = match &info.status {
                    ProviderStatus::Ready => "ready".to_string(),
                    ProviderStatus::NotAvailable(reason) => format!("unavailable: {}", reason),
                    ProviderStatus::Degraded(reason) => format!("degraded: {}", reason),
                };
                vec![
                    kind.to_string(),
                    info.version,
                    status,
                    yes_no(info.capabilities.file_transfer),
                    yes_no(info.capabilities.network_exposure),
                ]
            }
            Err(e) => vec![
                kind.to_string(),
                "-".to_string(),
                format!("unavailable: {}", e),
                yes_no(provider.capabilities().file_transfer),
                yes_no(provider.capabilities().network_exposure),
            ],
        };
        table.add_row(row);
    }

    println!("{}", table);
    println!(
        "Default provider: {}",
        config.provider.to_string().cyan().bold()
    );
    Ok(())
}

fn yes_no(flag: bool) -> String {
    if flag { "yes" } else { "no" }.to_string()
}
