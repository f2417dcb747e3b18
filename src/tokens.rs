//! Token counting facade over cached BPE encoders.
//!
//! Encoders are constructed lazily, once per normalized model name, and kept
//! for the life of the process. `shutdown()` drops them explicitly when the
//! server drains. Any failure degrades to the `len/4` estimator; callers can
//! rely on a finite, non-negative result for every input.

use std::collections::HashMap;
use std::sync::Arc;

use lazy_static::lazy_static;
use parking_lot::RwLock;
use tiktoken_rs::CoreBPE;
use tracing::debug;

lazy_static! {
    static ref ENCODERS: RwLock<HashMap<String, Option<Arc<CoreBPE>>>> =
        RwLock::new(HashMap::new());
}

/// Count tokens in `text` for `model`. Never fails; falls back to an
/// estimate when no encoder can be built.
pub fn count(text: &str, model: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    match encoder_for(model) {
        Some(bpe) => bpe.encode_with_special_tokens(text).len(),
        None => estimate(text),
    }
}

/// Drop all cached encoders. Called once at process shutdown.
pub fn shutdown() {
    let mut encoders = ENCODERS.write();
    let freed = encoders.len();
    encoders.clear();
    if freed > 0 {
        debug!(freed, "released encoder cache");
    }
}

/// `ceil(len/4)` estimator used when no encoder is available.
fn estimate(text: &str) -> usize {
    text.len().div_ceil(4)
}

/// Map API model names onto encoder names. Claude models count with the
/// gpt-4 encoder; newer OpenAI families fall back to cl100k_base.
fn normalize_model(model: &str) -> &str {
    if model.starts_with("claude") {
        "gpt-4"
    } else if model.starts_with("gpt-4o") || model.starts_with("o1") {
        "cl100k_base"
    } else {
        model
    }
}

fn encoder_for(model: &str) -> Option<Arc<CoreBPE>> {
    let name = normalize_model(model);

    if let Some(cached) = ENCODERS.read().get(name) {
        return cached.clone();
    }

    let built = build_encoder(name);
    // A failed build is cached too, so a bad model name costs one attempt.
    ENCODERS
        .write()
        .entry(name.to_string())
        .or_insert_with(|| built.clone());
    built
}

fn build_encoder(name: &str) -> Option<Arc<CoreBPE>> {
    let result = if name == "cl100k_base" {
        tiktoken_rs::cl100k_base()
    } else {
        tiktoken_rs::get_bpe_from_model(name).or_else(|_| tiktoken_rs::cl100k_base())
    };
    match result {
        Ok(bpe) => Some(Arc::new(bpe)),
        Err(err) => {
            debug!(model = name, error = %err, "no encoder available, estimating");
            None
        }
    }
}
