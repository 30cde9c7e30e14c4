use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

use url::Url;
use xxhash_rust::xxh3::xxh3_64;

use crate::resolver::ResourceKind;

const MAX_STEM_LEN: usize = 100;

/// Deterministic remote-to-local path mapping for one run.
///
/// Append-only: once an address has a path it keeps it. Paths follow the
/// remote directory structure, so two addresses only compete for a path when
/// sanitizing makes them equal; the later one then gets a suffix derived from
/// its own address.
#[derive(Debug)]
pub struct LocalLayout {
    seed_host: String,
    state: Mutex<LayoutState>,
}

#[derive(Debug, Default)]
struct LayoutState {
    by_key: HashMap<(String, ResourceKind), PathBuf>,
    taken: HashMap<PathBuf, String>,
}

impl LocalLayout {
    pub fn new(seed: &Url) -> Self {
        Self {
            seed_host: host_label(seed),
            state: Mutex::new(LayoutState::default()),
        }
    }

    /// Local path (relative to the output root) for the normalized address
    /// `key` stored as `kind`. Idempotent per key and kind; the same address
    /// stored as two kinds gets two paths.
    pub fn assign(&self, key: &str, url: &Url, kind: ResourceKind) -> PathBuf {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let slot = (key.to_string(), kind);
        if let Some(path) = state.by_key.get(&slot) {
            return path.clone();
        }

        let preferred = self.preferred_path(url, kind);
        let path = if !state.taken.contains_key(&preferred) {
            preferred
        } else {
            let suffix = short_hash(&format!("{}:{}", kind.as_str(), key));
            let hashed = with_suffix(&preferred, &suffix);
            if !state.taken.contains_key(&hashed) {
                hashed
            } else {
                (2..)
                    .map(|n| with_suffix(&preferred, &format!("{}-{}", suffix, n)))
                    .find(|candidate| !state.taken.contains_key(candidate))
                    .unwrap_or(hashed)
            }
        };

        state.taken.insert(path.clone(), key.to_string());
        state.by_key.insert(slot, path.clone());
        path
    }

    fn preferred_path(&self, url: &Url, kind: ResourceKind) -> PathBuf {
        match kind.dir() {
            None => self.page_path(url),
            Some(dir) => self.resource_path(dir, url, kind),
        }
    }

    fn page_path(&self, url: &Url) -> PathBuf {
        let mut segments: Vec<String> = url
            .path()
            .split('/')
            .filter(|s| !s.is_empty())
            .map(sanitize_segment)
            .collect();

        // Handle root and directory-like paths
        let last = match segments.pop() {
            None => "index.html".to_string(),
            Some(last) if url.path().ends_with('/') => {
                segments.push(last);
                "index.html".to_string()
            }
            Some(last) => match last.rsplit_once('.') {
                Some((stem, ext)) if ext.eq_ignore_ascii_case("html") || ext.eq_ignore_ascii_case("htm") => {
                    format!("{}.{}", stem, ext)
                }
                Some((stem, _)) if !stem.is_empty() => format!("{}.html", stem),
                _ => {
                    // No file extension, assume it's a directory
                    segments.push(last);
                    "index.html".to_string()
                }
            },
        };

        let last = match url.query().filter(|q| !q.is_empty()) {
            Some(query) => append_to_stem(&last, &short_hash(query)),
            None => last,
        };

        let mut path = PathBuf::new();
        let host = host_label(url);
        if host != self.seed_host {
            path.push(host);
        }
        for segment in segments {
            path.push(segment);
        }
        path.push(last);
        path
    }

    fn resource_path(&self, dir: &str, url: &Url, kind: ResourceKind) -> PathBuf {
        let mut segments: Vec<String> = url
            .path_segments()
            .map(|segments| segments.map(sanitize_segment).collect())
            .unwrap_or_default();
        let name = segments
            .pop()
            .filter(|name| !name.is_empty() && name != "." && name != "..")
            .unwrap_or_else(|| "resource".to_string());

        let name = if name.contains('.') {
            name
        } else {
            match kind {
                ResourceKind::Stylesheet => format!("{}.css", name),
                ResourceKind::Script => format!("{}.js", name),
                _ => name,
            }
        };

        let name = match url.query().filter(|q| !q.is_empty()) {
            Some(query) => append_to_stem(&name, &short_hash(query)),
            None => name,
        };

        let mut path = PathBuf::from(dir);
        let host = host_label(url);
        if host != self.seed_host {
            path.push(host);
        }
        for segment in segments.into_iter().filter(|s| !s.is_empty() && s != "." && s != "..") {
            path.push(segment);
        }
        path.push(truncate_stem(&name));
        path
    }
}


fn host_label(url: &Url) -> String {
    let host = url.host_str().unwrap_or("unknown-host");
    match url.port() {
        Some(port) => sanitize_segment(&format!("{}_{}", host, port)),
        None => sanitize_segment(host),
    }
}

fn sanitize_segment(segment: &str) -> String {
    let decoded = percent_decode(segment);
    decoded
        .chars()
        .map(|c| match c {
            '?' | '&' | '=' | '#' => '_',
            ' ' => '_',
            c if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' => c,
            _ => '_',
        })
        .collect()
}

fn percent_decode(segment: &str) -> String {
    url::form_urlencoded::parse(format!("x={}", segment.replace('+', "%2B").replace('&', "%26")).as_bytes())
        .next()
        .map(|(_, value)| value.into_owned())
        .unwrap_or_else(|| segment.to_string())
}

fn short_hash(value: &str) -> String {
    format!("{:08x}", xxh3_64(value.as_bytes()) as u32)
}

fn append_to_stem(name: &str, suffix: &str) -> String {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{}-{}.{}", stem, suffix, ext),
        _ => format!("{}-{}", name, suffix),
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(append_to_stem(&name, suffix))
}

fn truncate_stem(name: &str) -> String {
    match name.rsplit_once('.') {
        Some((stem, ext)) if stem.len() > MAX_STEM_LEN => format!("{}.{}", &stem[..MAX_STEM_LEN], ext),
        None if name.len() > MAX_STEM_LEN => name[..MAX_STEM_LEN].to_string(),
        _ => name.to_string(),
    }
}

/// Relative href from the document stored at `from` to the file at `to`,
/// both relative to the output root.
pub fn relative_href(from: &Path, to: &Path) -> String {
    let from_dir = from.parent().unwrap_or_else(|| Path::new(""));
    let relative = if from_dir.as_os_str().is_empty() {
        to.to_path_buf()
    } else {
        pathdiff::diff_paths(to, from_dir).unwrap_or_else(|| to.to_path_buf())
    };
    relative
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            Component::ParentDir => Some("..".to_string()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}
