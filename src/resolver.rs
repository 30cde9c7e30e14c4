//! Resource discovery over markup text.
//!
//! Nothing here parses into a DOM: the scanner walks tags and attributes with
//! regular expressions so that every reference keeps the exact byte range it
//! occupies in the document, which the rewriter later substitutes in place.

use std::ops::Range;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use url::Url;

use crate::css;

/// Schemes and prefixes that never name a fetchable resource.
const INERT_PREFIXES: &[&str] = &[
    "data:",
    "javascript:",
    "mailto:",
    "tel:",
    "blob:",
    "about:",
];

const FONT_EXTENSIONS: &[&str] = &["woff", "woff2", "ttf", "otf", "eot"];

static COMMENT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<!--.*?-->").unwrap());

static RAW_TEXT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<(script|style)\b[^>]*>(.*?)</(?:script|style)\s*>").unwrap()
});

static TAG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"<([a-zA-Z][a-zA-Z0-9:-]*)((?:\s+[^\s"'>/=]+(?:\s*=\s*(?:"[^"]*"|'[^']*'|[^\s"'=<>`]+))?)*)\s*/?>"#,
    )
    .unwrap()
});

static ATTR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\s+([^\s"'>/=]+)(?:\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'=<>`]+)))?"#).unwrap()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Page,
    Stylesheet,
    Script,
    Image,
    Font,
}

impl ResourceKind {
    /// Output subdirectory for resources of this kind. Pages live in the
    /// page tree at the root instead.
    pub fn dir(self) -> Option<&'static str> {
        match self {
            ResourceKind::Page => None,
            ResourceKind::Stylesheet => Some("css"),
            ResourceKind::Script => Some("js"),
            ResourceKind::Image => Some("images"),
            ResourceKind::Font => Some("fonts"),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Page => "page",
            ResourceKind::Stylesheet => "stylesheet",
            ResourceKind::Script => "script",
            ResourceKind::Image => "image",
            ResourceKind::Font => "font",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Html,
    Stylesheet,
}

/// Where a reference is written in its document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextLocation {
    pub value: Range<usize>,
    /// Bytes to drop when the reference is removed, e.g. the whole attribute.
    pub removal: Range<usize>,
    pub removal_replacement: &'static str,
    pub placement: Placement,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    /// An attribute value, `url(...)` token or `@import` target.
    Single,
    /// One candidate of the `srcset` value spanning `list`. Candidates of a
    /// list are rewritten together so separators never dangle.
    Candidate { list: Range<usize> },
    /// A `<base href>` tag. Local copies resolve against their own location,
    /// so the tag is always removed.
    Base,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResourceReference {
    pub raw: String,
    /// Absolute address, or `None` for inert values (`data:`, `#top`, ...).
    pub address: Option<Url>,
    pub kind: ResourceKind,
    pub owner: Url,
    /// `None` when the reference came from the network capture.
    pub location: Option<TextLocation>,
}

impl ResourceReference {
    pub fn is_fetchable(&self) -> bool {
        self.address.is_some()
    }

    pub(crate) fn at(
        raw: &str,
        address: Option<Url>,
        kind: ResourceKind,
        owner: &Url,
        location: TextLocation,
    ) -> Self {
        Self {
            raw: raw.to_string(),
            address,
            kind,
            owner: owner.clone(),
            location: Some(location),
        }
    }

    /// A reference known only from the renderer's network capture.
    pub fn captured(address: Url, kind: ResourceKind, owner: &Url) -> Self {
        Self {
            raw: address.to_string(),
            address: Some(address),
            kind,
            owner: owner.clone(),
            location: None,
        }
    }
}

/// Extract every resource reference of a document, in document order.
pub fn resolve(document: &str, base: &Url, kind: DocumentKind) -> Vec<ResourceReference> {
    let mut references = Vec::new();
    match kind {
        DocumentKind::Html => scan_html(document, base, &mut references),
        DocumentKind::Stylesheet => {
            css::scan_stylesheet(document, base, base, 0, false, &mut references)
        }
    }
    references
}

/// Resolve an address as written against `base`. Returns `None` for inert
/// values and for anything that does not end up as http(s).
pub fn resolve_address(raw: &str, base: &Url) -> Option<Url> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }
    let lower = trimmed.to_ascii_lowercase();
    if INERT_PREFIXES.iter().any(|prefix| lower.starts_with(prefix)) {
        return None;
    }

    let resolved = if lower.starts_with("http://") || lower.starts_with("https://") {
        Url::parse(trimmed).ok()?
    } else if trimmed.starts_with("//") {
        // Protocol-relative URL
        Url::parse(&format!("{}:{}", base.scheme(), trimmed)).ok()?
    } else {
        base.join(trimmed).ok()?
    };

    match resolved.scheme() {
        "http" | "https" => Some(resolved),
        _ => None,
    }
}

pub fn classify_by_extension(url: &Url) -> ResourceKind {
    let path = url.path().to_ascii_lowercase();
    let ext = path.rsplit('/').next().and_then(|name| name.rsplit_once('.')).map(|(_, ext)| ext);
    match ext {
        Some(ext) if FONT_EXTENSIONS.contains(&ext) => ResourceKind::Font,
        Some("css") => ResourceKind::Stylesheet,
        _ => ResourceKind::Image,
    }
}

struct Attribute<'a> {
    name: String,
    value: Option<(&'a str, Range<usize>)>,
    full: Range<usize>,
}

impl Attribute<'_> {
    fn value_str(&self) -> Option<&str> {
        self.value.as_ref().map(|(v, _)| *v)
    }
}

fn find_attr<'b, 'a>(attrs: &'b [Attribute<'a>], name: &str) -> Option<&'b Attribute<'a>> {
    attrs.iter().find(|attr| attr.name == name)
}

fn in_ranges(pos: usize, ranges: &[Range<usize>]) -> bool {
    ranges.iter().any(|range| range.contains(&pos))
}

fn scan_html(html: &str, page_base: &Url, out: &mut Vec<ResourceReference>) {
    let owner = page_base.clone();
    let mut base = page_base.clone();
    let mut base_seen = false;

    let comments: Vec<Range<usize>> = COMMENT_RE.find_iter(html).map(|m| m.range()).collect();

    // Raw-text bodies: tags inside them are not markup. Style bodies are
    // scanned as stylesheets in document order below.
    let mut raw_bodies: Vec<Range<usize>> = Vec::new();
    let mut style_bodies: Vec<Range<usize>> = Vec::new();
    for caps in RAW_TEXT_RE.captures_iter(html) {
        let whole = caps.get(0).expect("group 0 always matches");
        if in_ranges(whole.start(), &comments) {
            continue;
        }
        let body = caps.get(2).expect("body group always matches");
        raw_bodies.push(body.range());
        if caps[1].eq_ignore_ascii_case("style") {
            style_bodies.push(body.range());
        }
    }

    let mut style_iter = style_bodies.into_iter().peekable();

    for caps in TAG_RE.captures_iter(html) {
        let tag = caps.get(0).expect("group 0 always matches");
        if in_ranges(tag.start(), &comments) || in_ranges(tag.start(), &raw_bodies) {
            continue;
        }

        // Flush embedded style blocks that precede this tag.
        while let Some(body) = style_iter.next_if(|body| body.start <= tag.start()) {
            css::scan_stylesheet(&html[body.clone()], &base, &owner, body.start, false, out);
        }

        let name = caps[1].to_ascii_lowercase();
        let attrs_match = caps.get(2).expect("attribute group always matches");
        let attrs = parse_attributes(html, attrs_match.start(), attrs_match.as_str());

        if name == "base" {
            if let Some((href, range)) = find_attr(&attrs, "href").and_then(|a| a.value.clone()) {
                if !base_seen {
                    if let Some(resolved) = resolve_address(&decode(href), page_base) {
                        base = resolved;
                        base_seen = true;
                    }
                }
                out.push(ResourceReference::at(
                    href,
                    None,
                    ResourceKind::Page,
                    &owner,
                    TextLocation {
                        value: range,
                        removal: tag.range(),
                        removal_replacement: "",
                        placement: Placement::Base,
                    },
                ));
            }
            continue;
        }

        for (attr_name, kind) in attribute_kinds(&name, &attrs) {
            if let Some(attr) = find_attr(&attrs, attr_name) {
                if attr_name == "srcset" {
                    push_srcset(attr, &base, &owner, out);
                } else {
                    push_attribute(attr, kind, &base, &owner, out);
                }
            }
        }

        if let Some(style) = find_attr(&attrs, "style") {
            if let Some((value, range)) = &style.value {
                css::scan_stylesheet(value, &base, &owner, range.start, true, out);
            }
        }
    }

    for body in style_iter {
        css::scan_stylesheet(&html[body.clone()], &base, &owner, body.start, false, out);
    }
}

/// Which attributes of a tag carry resource addresses, and of what kind.
fn attribute_kinds(tag: &str, attrs: &[Attribute<'_>]) -> Vec<(&'static str, ResourceKind)> {
    let attr_lower = |name: &str| {
        find_attr(attrs, name)
            .and_then(|a| a.value_str())
            .map(|v| v.to_ascii_lowercase())
            .unwrap_or_default()
    };

    match tag {
        "link" => {
            let rel = attr_lower("rel");
            let rels: Vec<&str> = rel.split_whitespace().collect();
            if rels.contains(&"stylesheet") {
                vec![("href", ResourceKind::Stylesheet)]
            } else if rels.iter().any(|r| r.contains("icon")) {
                vec![("href", ResourceKind::Image)]
            } else if rels.contains(&"preload") {
                match attr_lower("as").as_str() {
                    "font" => vec![("href", ResourceKind::Font)],
                    "style" => vec![("href", ResourceKind::Stylesheet)],
                    "image" => vec![("href", ResourceKind::Image)],
                    "script" => vec![("href", ResourceKind::Script)],
                    _ => Vec::new(),
                }
            } else {
                Vec::new()
            }
        }
        "script" => vec![("src", ResourceKind::Script)],
        "img" => vec![("src", ResourceKind::Image), ("srcset", ResourceKind::Image)],
        "source" => {
            let mut kinds = vec![("srcset", ResourceKind::Image)];
            if attr_lower("type").starts_with("image/") {
                kinds.push(("src", ResourceKind::Image));
            }
            kinds
        }
        "input" if attr_lower("type") == "image" => vec![("src", ResourceKind::Image)],
        "video" => vec![("poster", ResourceKind::Image)],
        "a" | "area" => vec![("href", ResourceKind::Page)],
        _ => Vec::new(),
    }
}

fn parse_attributes<'a>(html: &'a str, offset: usize, region: &'a str) -> Vec<Attribute<'a>> {
    ATTR_RE
        .captures_iter(region)
        .map(|caps| {
            let full = caps.get(0).expect("group 0 always matches");
            let value = caps
                .get(2)
                .or_else(|| caps.get(3))
                .or_else(|| caps.get(4))
                .map(|m| {
                    let range = offset + m.start()..offset + m.end();
                    (&html[range.clone()], range)
                });
            Attribute {
                name: caps[1].to_ascii_lowercase(),
                value,
                full: offset + full.start()..offset + full.end(),
            }
        })
        .collect()
}

fn decode(value: &str) -> String {
    html_escape::decode_html_entities(value).into_owned()
}

fn push_attribute(
    attr: &Attribute<'_>,
    kind: ResourceKind,
    base: &Url,
    owner: &Url,
    out: &mut Vec<ResourceReference>,
) {
    let Some((value, range)) = &attr.value else {
        return;
    };
    let address = resolve_address(&decode(value), base);
    out.push(ResourceReference::at(
        value,
        address,
        kind,
        owner,
        TextLocation {
            value: range.clone(),
            removal: attr.full.clone(),
            removal_replacement: "",
            placement: Placement::Single,
        },
    ));
}

/// One reference per `srcset` candidate; its removal range is the candidate
/// without separators.
fn push_srcset(attr: &Attribute<'_>, base: &Url, owner: &Url, out: &mut Vec<ResourceReference>) {
    let Some((value, range)) = &attr.value else {
        return;
    };
    for (url_range, candidate_end) in srcset_candidates(value) {
        let raw = &value[url_range.clone()];
        out.push(ResourceReference::at(
            raw,
            resolve_address(&decode(raw), base),
            ResourceKind::Image,
            owner,
            TextLocation {
                value: range.start + url_range.start..range.start + url_range.end,
                removal: range.start + url_range.start..range.start + candidate_end,
                removal_replacement: "",
                placement: Placement::Candidate { list: range.clone() },
            },
        ));
    }
}

/// Split a srcset value into (url range, candidate end) pairs, offsets
/// relative to the value.
fn srcset_candidates(value: &str) -> Vec<(Range<usize>, usize)> {
    let bytes = value.as_bytes();
    let mut candidates = Vec::new();
    let mut pos = 0;

    while pos < bytes.len() {
        while pos < bytes.len() && (bytes[pos].is_ascii_whitespace() || bytes[pos] == b',') {
            pos += 1;
        }
        if pos >= bytes.len() {
            break;
        }
        let start = pos;
        while pos < bytes.len() && !bytes[pos].is_ascii_whitespace() {
            pos += 1;
        }
        let mut url_end = pos;
        let candidate_end;
        if value[start..url_end].ends_with(',') {
            while url_end > start && bytes[url_end - 1] == b',' {
                url_end -= 1;
            }
            candidate_end = url_end;
        } else {
            while pos < bytes.len() && bytes[pos] != b',' {
                pos += 1;
            }
            candidate_end = value[..pos].trim_end().len();
        }
        if url_end > start {
            candidates.push((start..url_end, candidate_end));
        }
    }
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://example.com/subdir/page.html").unwrap()
    }

    fn addresses(refs: &[ResourceReference], kind: ResourceKind) -> Vec<String> {
        refs.iter()
            .filter(|r| r.kind == kind)
            .filter_map(|r| r.address.as_ref().map(|u| u.to_string()))
            .collect()
    }

    #[test]
    fn test_extract_basic_tags() {
        let html = r#"
            <html>
                <head>
                    <link rel="stylesheet" href="/style.css">
                    <script src="/script.js"></script>
                </head>
                <body>
                    <img src="/image.jpg" alt="test">
                    <a href="/page">Link</a>
                </body>
            </html>
        "#;
        let refs = resolve(html, &base(), DocumentKind::Html);

        assert_eq!(refs.len(), 4);
        assert_eq!(addresses(&refs, ResourceKind::Stylesheet), vec!["https://example.com/style.css"]);
        assert_eq!(addresses(&refs, ResourceKind::Script), vec!["https://example.com/script.js"]);
        assert_eq!(addresses(&refs, ResourceKind::Image), vec!["https://example.com/image.jpg"]);
        assert_eq!(addresses(&refs, ResourceKind::Page), vec!["https://example.com/page"]);
    }

    #[test]
    fn test_url_resolution() {
        let base = Url::parse("https://example.com/subdir/").unwrap();
        let test_cases = vec![
            ("../style.css", "https://example.com/style.css"),
            ("./script.js", "https://example.com/subdir/script.js"),
            ("images/photo.jpg", "https://example.com/subdir/images/photo.jpg"),
            ("https://cdn.example.com/style.css", "https://cdn.example.com/style.css"),
            ("//cdn.example.com/script.js", "https://cdn.example.com/script.js"),
            ("  /padded.png ", "https://example.com/padded.png"),
        ];

        for (input, expected) in test_cases {
            let result = resolve_address(input, &base).unwrap();
            assert_eq!(result.as_str(), expected, "Failed for input: {}", input);
        }
    }

    #[test]
    fn test_inert_values_are_kept_but_not_fetchable() {
        let html = r##"<img src=""><img src="#top"><img src="data:image/png;base64,AAAA">
            <a href="javascript:void(0)">x</a><a href="mailto:a@b.c">y</a>"##;
        let refs = resolve(html, &base(), DocumentKind::Html);

        assert_eq!(refs.len(), 5);
        assert!(refs.iter().all(|r| !r.is_fetchable()));
        assert_eq!(refs[2].raw, "data:image/png;base64,AAAA");
    }

    #[test]
    fn test_locations_point_at_values() {
        let html = r#"<img alt="x" src="a.png" >"#;
        let refs = resolve(html, &base(), DocumentKind::Html);
        let location = refs[0].location.as_ref().unwrap();

        assert_eq!(&html[location.value.clone()], "a.png");
        assert_eq!(&html[location.removal.clone()], r#" src="a.png""#);
    }

    #[test]
    fn test_srcset_candidates() {
        let html = r#"<img srcset="small.png 1x, large.png 2x">"#;
        let refs = resolve(html, &base(), DocumentKind::Html);

        assert_eq!(refs.len(), 2);
        let first = refs[0].location.as_ref().unwrap();
        let second = refs[1].location.as_ref().unwrap();
        assert_eq!(&html[first.value.clone()], "small.png");
        assert_eq!(&html[first.removal.clone()], "small.png 1x");
        assert_eq!(&html[second.value.clone()], "large.png");
        assert_eq!(&html[second.removal.clone()], "large.png 2x");
        match (&first.placement, &second.placement) {
            (Placement::Candidate { list: a }, Placement::Candidate { list: b }) => {
                assert_eq!(a, b);
                assert_eq!(&html[a.clone()], "small.png 1x, large.png 2x");
            }
            other => panic!("unexpected placements: {:?}", other),
        }
    }

    #[test]
    fn test_base_tag_is_recorded_for_removal() {
        let html = r#"<head><base href="/"><link rel="stylesheet" href="css/site.css"></head>"#;
        let refs = resolve(html, &base(), DocumentKind::Html);

        assert_eq!(refs.len(), 2);
        let base_ref = &refs[0];
        assert!(!base_ref.is_fetchable());
        let location = base_ref.location.as_ref().unwrap();
        assert_eq!(location.placement, Placement::Base);
        assert_eq!(&html[location.removal.clone()], r#"<base href="/">"#);
        assert_eq!(addresses(&refs, ResourceKind::Stylesheet), vec!["https://example.com/css/site.css"]);
    }

    #[test]
    fn test_comments_and_script_bodies_are_ignored() {
        let html = r#"
            <!-- <img src="commented.png"> -->
            <script>if (a<b && c>d) { document.write('<img src="js.png">'); }</script>
            <img src="real.png">
        "#;
        let refs = resolve(html, &base(), DocumentKind::Html);

        assert_eq!(addresses(&refs, ResourceKind::Image), vec!["https://example.com/subdir/real.png"]);
    }

    #[test]
    fn test_base_href_changes_resolution() {
        let html = r#"<head><base href="https://static.example.org/assets/"></head><img src="logo.png">"#;
        let refs = resolve(html, &base(), DocumentKind::Html);

        assert_eq!(addresses(&refs, ResourceKind::Image), vec!["https://static.example.org/assets/logo.png"]);
        assert_eq!(refs[0].owner, base());
    }

    #[test]
    fn test_inline_style_and_style_block() {
        let html = r#"<style>
                @font-face { font-family: X; src: url("/fonts/x.woff2") format("woff2"); }
                .hero { background: url(/img/hero.jpg) no-repeat; }
            </style>
            <div style="background-image: url(&quot;/img/inline.png&quot;)"></div>"#;
        let refs = resolve(html, &base(), DocumentKind::Html);

        assert_eq!(addresses(&refs, ResourceKind::Font), vec!["https://example.com/fonts/x.woff2"]);
        assert_eq!(
            addresses(&refs, ResourceKind::Image),
            vec!["https://example.com/img/hero.jpg", "https://example.com/img/inline.png"]
        );
    }

    #[test]
    fn test_link_rel_variants() {
        let html = r#"
            <link rel="icon" href="/favicon.ico">
            <link rel="preload" as="font" href="/f.woff2" crossorigin>
            <link rel="canonical" href="/canonical">
            <link rel="alternate stylesheet" href="/alt.css">
        "#;
        let refs = resolve(html, &base(), DocumentKind::Html);

        assert_eq!(refs.len(), 3);
        assert_eq!(refs[0].kind, ResourceKind::Image);
        assert_eq!(refs[1].kind, ResourceKind::Font);
        assert_eq!(refs[2].kind, ResourceKind::Stylesheet);
    }

    #[test]
    fn test_duplicates_are_preserved() {
        let html = r#"<img src="/a.png"><img src="/a.png">"#;
        let refs = resolve(html, &base(), DocumentKind::Html);
        assert_eq!(refs.len(), 2);
        assert_ne!(refs[0].location, refs[1].location);
    }

    #[test]
    fn test_entities_in_attribute_values() {
        let html = r#"<img src="/img?a=1&amp;b=2">"#;
        let refs = resolve(html, &base(), DocumentKind::Html);
        assert_eq!(refs[0].address.as_ref().unwrap().as_str(), "https://example.com/img?a=1&b=2");
        assert_eq!(refs[0].raw, "/img?a=1&amp;b=2");
    }

    #[test]
    fn test_classify_by_extension() {
        let url = |s: &str| Url::parse(s).unwrap();
        assert_eq!(classify_by_extension(&url("https://e.com/a.WOFF2")), ResourceKind::Font);
        assert_eq!(classify_by_extension(&url("https://e.com/a.css?v=1")), ResourceKind::Stylesheet);
        assert_eq!(classify_by_extension(&url("https://e.com/a.svg")), ResourceKind::Image);
        assert_eq!(classify_by_extension(&url("https://e.com/noext")), ResourceKind::Image);
    }
}
