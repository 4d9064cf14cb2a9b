//! Default state document for the music browser and its validators.
//!
//! Sections:
//! - `tracks`: loaded track list, lookup by id, the focused track
//! - `playlists`: saved playlists, the active one and the draft being built
//! - `selection`: selected track ids and the range anchor
//! - `ui`: view mode, zoom and panel flags of the tree canvas
//! - `app`: version and startup flags
//! - `data`: library scan bookkeeping and known tags
//! - `dom`: opaque handles owned by the rendering layer

use chrono::Utc;
use std::sync::Arc;

use super::Validator;
use crate::validation::{self, Rule};
use crate::value::{Record, Value, ValueSet};

/// View modes the tree canvas understands.
pub const VIEW_MODES: &[&str] = &["tree", "list", "grid"];

/// Zoom bounds of the tree canvas.
pub const MIN_ZOOM: f64 = 0.1;
pub const MAX_ZOOM: f64 = 10.0;

fn section<const N: usize>(fields: [(&str, Value); N]) -> Value {
    Value::Record(
        fields
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect::<Record>(),
    )
}

/// Initial document every reset returns to.
pub fn default_document() -> Value {
    section([
        (
            "tracks",
            section([
                ("items", Value::List(Vec::new())),
                ("byId", Value::record()),
                ("current", Value::Null),
                ("loading", Value::Bool(false)),
            ]),
        ),
        (
            "playlists",
            section([
                ("items", Value::List(Vec::new())),
                ("active", Value::Null),
                ("draft", Value::List(Vec::new())),
            ]),
        ),
        (
            "selection",
            section([
                ("tracks", Value::Set(ValueSet::new())),
                ("anchor", Value::Null),
            ]),
        ),
        (
            "ui",
            section([
                ("view", Value::from("tree")),
                ("zoom", Value::Float(1.0)),
                ("sidebarOpen", Value::Bool(true)),
                ("theme", Value::from("dark")),
            ]),
        ),
        (
            "app",
            section([
                ("version", Value::from(env!("CARGO_PKG_VERSION"))),
                ("initialized", Value::Bool(false)),
                ("bootedAt", Value::Timestamp(Utc::now())),
            ]),
        ),
        (
            "data",
            section([
                ("lastScan", Value::Null),
                ("tags", Value::Set(ValueSet::new())),
            ]),
        ),
        (
            "dom",
            section([("tree", Value::Null), ("canvas", Value::Null)]),
        ),
    ])
}

/// Wrap a field rule as a store validator.
pub fn validator(rule: Rule) -> Validator {
    Arc::new(move |value: &Value| rule(Some(value)))
}

/// Validators installed alongside [`default_document`].
pub fn default_validators() -> Vec<(&'static str, Validator)> {
    vec![
        ("tracks.items", validator(validation::is_list())),
        ("tracks.loading", validator(validation::is_bool())),
        ("playlists.items", validator(validation::is_list())),
        ("playlists.draft", validator(validation::is_list())),
        ("selection.tracks", validator(validation::is_set())),
        ("ui.view", validator(validation::one_of(VIEW_MODES))),
        ("ui.zoom", validator(validation::number_in(MIN_ZOOM, MAX_ZOOM))),
        ("ui.sidebarOpen", validator(validation::is_bool())),
        ("app.initialized", validator(validation::is_bool())),
    ]
}
