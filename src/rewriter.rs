//! In-place substitution of references in document text.

use std::collections::HashMap;
use std::ops::Range;
use std::path::{Path, PathBuf};

use url::Url;

use crate::config::{FailurePolicy, MirrorConfig};
use crate::document::DocumentRecord;
use crate::layout::relative_href;
use crate::registry::{normalize, VisitedRegistry};
use crate::resolver::{Placement, ResourceKind, ResourceReference, TextLocation};

/// What happens to one reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Substitution {
    Local(String),
    Remote(String),
    /// Drop the reference per its removal range.
    Remove,
    Keep,
}

/// Apply `decide` to every located reference of `text`.
///
/// Substitutions are applied from the end of the document backwards so the
/// offsets of earlier references stay valid. A reference overlapping one
/// already applied is left alone.
pub fn rewrite<F>(text: &str, references: &[ResourceReference], mut decide: F) -> String
where
    F: FnMut(&ResourceReference) -> Substitution,
{
    let mut edits: Vec<(Range<usize>, String)> = Vec::new();
    let mut lists: Vec<(Range<usize>, Vec<(&TextLocation, Substitution)>)> = Vec::new();

    for reference in references {
        let Some(location) = reference.location.as_ref() else {
            continue;
        };
        let substitution = decide(reference);
        if let Placement::Candidate { list } = &location.placement {
            match lists.last_mut() {
                Some((range, candidates)) if range == list => candidates.push((location, substitution)),
                _ => lists.push((list.clone(), vec![(location, substitution)])),
            }
            continue;
        }
        match substitution {
            Substitution::Keep => {}
            Substitution::Local(value) | Substitution::Remote(value) => {
                edits.push((location.value.clone(), value));
            }
            Substitution::Remove => {
                edits.push((location.removal.clone(), location.removal_replacement.to_string()));
            }
        }
    }

    for (list, candidates) in lists {
        if candidates.iter().all(|(_, substitution)| *substitution == Substitution::Keep) {
            continue;
        }
        if let Some(rebuilt) = rebuild_list(text, &candidates) {
            edits.push((list, rebuilt));
        }
    }

    edits.retain(|(range, _)| range.start <= range.end && range.end <= text.len());
    edits.sort_by(|a, b| b.0.start.cmp(&a.0.start).then(b.0.end.cmp(&a.0.end)));

    let mut output = text.to_string();
    let mut floor = text.len();
    for (range, replacement) in edits {
        if range.end > floor {
            continue;
        }
        output.replace_range(range.clone(), &replacement);
        floor = range.start;
    }
    output
}

/// The surviving candidates of one `srcset` list, joined again.
fn rebuild_list(text: &str, candidates: &[(&TextLocation, Substitution)]) -> Option<String> {
    let mut kept = Vec::with_capacity(candidates.len());
    for (location, substitution) in candidates {
        let candidate = text.get(location.removal.clone())?;
        let descriptor = text.get(location.value.end..location.removal.end)?;
        match substitution {
            Substitution::Keep => kept.push(candidate.to_string()),
            Substitution::Local(value) | Substitution::Remote(value) => {
                kept.push(format!("{}{}", value, descriptor))
            }
            Substitution::Remove => {}
        }
    }
    Some(kept.join(", "))
}

/// Decides substitutions from the run's shared state.
pub struct PathRewriter<'a> {
    registry: &'a VisitedRegistry,
    config: &'a MirrorConfig,
}

impl<'a> PathRewriter<'a> {
    pub fn new(registry: &'a VisitedRegistry, config: &'a MirrorConfig) -> Self {
        Self { registry, config }
    }

    /// Rewrite a sealed document. With `pages` absent, page links stay as
    /// written; with it, they point at the mirrored copy when there is one
    /// and at the remote address otherwise.
    pub fn rewrite(&self, record: &DocumentRecord, pages: Option<&HashMap<String, PathBuf>>) -> String {
        let from = record.local_path.clone().unwrap_or_default();
        rewrite(&record.text, &record.references, |reference| self.decide(&from, reference, pages))
    }

    pub fn decide(
        &self,
        from: &Path,
        reference: &ResourceReference,
        pages: Option<&HashMap<String, PathBuf>>,
    ) -> Substitution {
        if reference.location.as_ref().is_some_and(|l| l.placement == Placement::Base) {
            return Substitution::Remove;
        }
        let Some(address) = reference.address.as_ref() else {
            return Substitution::Keep;
        };
        let key = normalize(address);

        if reference.kind == ResourceKind::Page {
            let Some(pages) = pages else {
                return Substitution::Keep;
            };
            if let Some(target) = pages.get(&key) {
                return Substitution::Local(local_href(from, target, address));
            }
            // A link to an address that was stored as a resource.
            return match self.registry.result(&key) {
                Some(result) if result.is_stored() => match result.local_path.as_ref() {
                    Some(target) => Substitution::Local(local_href(from, target, address)),
                    None => Substitution::Remote(address.to_string()),
                },
                _ => Substitution::Remote(address.to_string()),
            };
        }

        if !self.config.downloads(reference.kind) {
            return Substitution::Remote(address.to_string());
        }

        match self.registry.result(&key) {
            Some(result) if result.is_stored() => match result.local_path.as_ref() {
                Some(target) => Substitution::Local(local_href(from, target, address)),
                None => self.on_failure(address),
            },
            _ => self.on_failure(address),
        }
    }

    fn on_failure(&self, address: &Url) -> Substitution {
        match self.config.failure_policy {
            FailurePolicy::Drop => Substitution::Remove,
            FailurePolicy::KeepRemote => Substitution::Remote(address.to_string()),
        }
    }
}

fn local_href(from: &Path, target: &Path, address: &Url) -> String {
    let href = relative_href(from, target);
    match address.fragment() {
        Some(fragment) => format!("{}#{}", href, fragment),
        None => href,
    }
}
