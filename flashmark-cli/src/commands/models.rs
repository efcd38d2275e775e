use anyhow::Result;

use crate::app::App;
use crate::OutputFormat;

pub fn run(app: &App, format: OutputFormat) -> Result<()> {
    let collection = app.open_collection()?;
    let models = collection.models()?;

    match format {
        OutputFormat::Json => {
            let out: Vec<_> = models
                .iter()
                .map(|m| {
                    serde_json::json!({
                        "id": m.id,
                        "name": m.name,
                        "fields": m.fields,
                        "cards": m.card_templates,
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        OutputFormat::Plain => {
            if models.is_empty() {
                println!("No models.");
                return Ok(());
            }
            let width = models.iter().map(|m| m.name.len()).max().unwrap_or(0);
            for model in &models {
                println!("{:<width$}  {}", model.name, model.fields.join(", "));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flashmark_core::{Collection, SyncConfig};

    #[test]
    fn test_lists_stock_models() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("collection.db");
        Collection::create(&path).unwrap();
        let app = App::with_config(SyncConfig::default(), Some(&path));

        run(&app, OutputFormat::Plain).unwrap();
        run(&app, OutputFormat::Json).unwrap();
    }
}
