//! Model (note type) descriptors and the per-run model lookup table.

use crate::{FlashmarkError, ModelId, NoteStore, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// LaTeX preamble used for models created by this crate.
pub const DEFAULT_LATEX_PRE: &str = "\\documentclass[12pt]{article}\n\
\\special{papersize=3in,5in}\n\
\\usepackage[utf8]{inputenc}\n\
\\usepackage{amssymb,amsmath}\n\
\\pagestyle{empty}\n\
\\setlength{\\parindent}{0in}\n\
\\begin{document}\n";

/// LaTeX postamble used for models created by this crate.
pub const DEFAULT_LATEX_POST: &str = "\\end{document}";

/// A note type: a name, its ordered field names and its LaTeX wrapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Model {
    pub id: ModelId,
    pub name: String,
    pub fields: Vec<String>,
    /// Number of cards generated for each new note.
    pub card_templates: usize,
    pub latex_pre: String,
    pub latex_post: String,
}

impl Model {
    /// Returns the position of `name` in the model's field order.
    ///
    /// A trailing ` (markdown)` marker is ignored, and a name that matches no
    /// field exactly is matched case-insensitively.
    pub fn field_index(&self, name: &str) -> Option<usize> {
        let name = strip_markdown_marker(name);
        self.fields
            .iter()
            .position(|field| field == name)
            .or_else(|| {
                let folded = name.to_lowercase();
                self.fields.iter().position(|field| field.to_lowercase() == folded)
            })
    }

    /// Maps block field names onto model field positions.
    ///
    /// The names must all be declared by the model and appear in the model's
    /// order; fields may be omitted.
    ///
    /// # Errors
    ///
    /// Returns [`FlashmarkError::FieldMismatch`] naming the first unknown or
    /// out-of-order field.
    pub fn field_positions<'n>(&self, names: impl IntoIterator<Item = &'n str>) -> Result<Vec<usize>> {
        let mut positions: Vec<usize> = Vec::new();
        for name in names {
            let index = self.field_index(name).ok_or_else(|| FlashmarkError::FieldMismatch {
                model: self.name.clone(),
                message: format!(
                    "unknown field '{name}' (expected one of: {})",
                    self.fields.join(", ")
                ),
            })?;
            if positions.contains(&index) {
                return Err(FlashmarkError::FieldMismatch {
                    model: self.name.clone(),
                    message: format!("field '{}' is given twice", self.fields[index]),
                });
            }
            if let Some(&previous) = positions.last() {
                if index < previous {
                    return Err(FlashmarkError::FieldMismatch {
                        model: self.name.clone(),
                        message: format!(
                            "field '{name}' must come before '{}'",
                            self.fields[previous]
                        ),
                    });
                }
            }
            positions.push(index);
        }
        Ok(positions)
    }
}

fn strip_markdown_marker(name: &str) -> &str {
    const MARKER: &str = " (markdown)";
    let Some(split) = name.len().checked_sub(MARKER.len()) else {
        return name;
    };
    match name.get(split..) {
        Some(tail) if tail.eq_ignore_ascii_case(MARKER) => &name[..split],
        _ => name,
    }
}

/// Immutable name → model table resolved once at the start of a run.
///
/// Names that the collection does not know are remembered as missing so that
/// every block naming them fails with [`FlashmarkError::UnknownModel`] without
/// another lookup.
#[derive(Debug, Default)]
pub struct ModelTable {
    models: HashMap<String, Option<Model>>,
}

impl ModelTable {
    /// Resolves every distinct name in `names` through `store`.
    ///
    /// # Errors
    ///
    /// Propagates store errors; unknown names are not an error here.
    pub fn load<'n, S: NoteStore + ?Sized>(
        store: &S,
        names: impl IntoIterator<Item = &'n str>,
    ) -> Result<Self> {
        let mut models = HashMap::new();
        for name in names {
            if models.contains_key(name) {
                continue;
            }
            let model = store.find_model(name)?;
            if model.is_none() {
                log::warn!("model '{name}' is not defined in the collection");
            }
            models.insert(name.to_string(), model);
        }
        Ok(Self { models })
    }

    /// Returns the model named `name`.
    ///
    /// # Errors
    ///
    /// Returns [`FlashmarkError::UnknownModel`] if the collection has no such model.
    pub fn get(&self, name: &str) -> Result<&Model> {
        self.models
            .get(name)
            .and_then(Option::as_ref)
            .ok_or_else(|| FlashmarkError::UnknownModel(name.to_string()))
    }
}
