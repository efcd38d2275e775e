use anyhow::{anyhow, Result};
use flashmark_core::{media_references, render_note};

use crate::app::App;
use crate::OutputFormat;

pub fn run(app: &App, nid: i64, format: OutputFormat) -> Result<()> {
    let collection = app.open_collection()?;
    let note = collection
        .get_note(nid)?
        .ok_or_else(|| anyhow!("note {nid} does not exist"))?;
    let model = collection
        .model(&note.model_name)?
        .ok_or_else(|| anyhow!("model '{}' of note {nid} does not exist", note.model_name))?;

    match format {
        OutputFormat::Json => {
            let fields: serde_json::Map<_, _> = model
                .fields
                .iter()
                .zip(&note.fields)
                .map(|(name, value)| (name.clone(), serde_json::Value::from(value.as_str())))
                .collect();
            let media: Vec<String> = note.fields.iter().flat_map(|f| media_references(f)).collect();
            let out = serde_json::json!({
                "id": note.id,
                "model": note.model_name,
                "deck": note.deck,
                "tags": note.tags,
                "cards": note.card_count,
                "modified": note.modified,
                "fields": fields,
                "media": media,
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        OutputFormat::Plain => print!("{}", render_note(&note, &model)),
    }
    Ok(())
}
