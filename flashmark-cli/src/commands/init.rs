use anyhow::{bail, Context, Result};
use flashmark_core::Collection;

use crate::app::App;
use crate::OutputFormat;

pub fn run(app: &App, format: OutputFormat) -> Result<()> {
    let path = &app.collection_path;
    if path.exists() {
        bail!("{} already exists", path.display());
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }

    let collection = Collection::create(path)?;
    let models = collection.models()?;
    match format {
        OutputFormat::Json => {
            let out = serde_json::json!({
                "collection": path,
                "models": models.iter().map(|m| &m.name).collect::<Vec<_>>(),
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        OutputFormat::Plain => {
            println!("Created {} with {} models", path.display(), models.len());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flashmark_core::SyncConfig;

    #[test]
    fn test_init_creates_and_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("collection.db");
        let app = App::with_config(SyncConfig::default(), Some(&path));

        run(&app, OutputFormat::Plain).unwrap();
        assert!(path.exists());
        assert!(app.open_collection().unwrap().model("Basic").unwrap().is_some());

        let err = run(&app, OutputFormat::Plain).unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }
}
