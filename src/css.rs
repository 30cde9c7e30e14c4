//! `url(...)` and `@import` discovery in stylesheet text.

use std::ops::Range;
use std::sync::LazyLock;

use regex::Regex;
use url::Url;

use crate::resolver::{classify_by_extension, resolve_address, Placement, ResourceKind, ResourceReference, TextLocation};

static CSS_COMMENT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)/\*.*?\*/").unwrap());

static FONT_FACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)@font-face\s*\{[^}]*\}").unwrap());

static URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)url\(\s*(?:"([^"]*)"|'([^']*)'|([^)"'\s]*))\s*\)"#).unwrap()
});

static IMPORT_STRING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)@import\s+(?:"([^"]*)"|'([^']*)')"#).unwrap());

/// Append the references found in `css` to `out`.
///
/// `offset` is where `css` starts inside the owning document, so locations
/// are always document-absolute. Inside an HTML attribute the address may be
/// wrapped in `&quot;` entities, which `in_attribute` unwraps.
pub fn scan_stylesheet(
    css: &str,
    base: &Url,
    owner: &Url,
    offset: usize,
    in_attribute: bool,
    out: &mut Vec<ResourceReference>,
) {
    let comments: Vec<Range<usize>> = CSS_COMMENT_RE.find_iter(css).map(|m| m.range()).collect();
    let font_faces: Vec<Range<usize>> = FONT_FACE_RE.find_iter(css).map(|m| m.range()).collect();
    let inside = |pos: usize, ranges: &[Range<usize>]| ranges.iter().any(|r| r.contains(&pos));

    let mut found: Vec<(usize, ResourceReference)> = Vec::new();

    for caps in URL_RE.captures_iter(css) {
        let whole = caps.get(0).expect("group 0 always matches");
        if inside(whole.start(), &comments) {
            continue;
        }
        let Some(value) = caps.get(1).or_else(|| caps.get(2)).or_else(|| caps.get(3)) else {
            continue;
        };

        let cleaned = clean_value(value.as_str(), in_attribute);
        let address = resolve_address(&cleaned, base);
        let kind = if inside(whole.start(), &font_faces) {
            ResourceKind::Font
        } else if follows_import(&css[..whole.start()]) {
            ResourceKind::Stylesheet
        } else {
            address.as_ref().map(classify_by_extension).unwrap_or(ResourceKind::Image)
        };

        found.push((
            whole.start(),
            ResourceReference::at(
                value.as_str(),
                address,
                kind,
                owner,
                TextLocation {
                    value: offset + value.start()..offset + value.end(),
                    removal: offset + whole.start()..offset + whole.end(),
                    removal_replacement: "none",
                    placement: Placement::Single,
                },
            ),
        ));
    }

    for caps in IMPORT_STRING_RE.captures_iter(css) {
        let whole = caps.get(0).expect("group 0 always matches");
        if inside(whole.start(), &comments) {
            continue;
        }
        let Some(value) = caps.get(1).or_else(|| caps.get(2)) else {
            continue;
        };
        // The quoted token including its quotes.
        let token = value.start() - 1..value.end() + 1;
        found.push((
            whole.start(),
            ResourceReference::at(
                value.as_str(),
                resolve_address(value.as_str(), base),
                ResourceKind::Stylesheet,
                owner,
                TextLocation {
                    value: offset + value.start()..offset + value.end(),
                    removal: offset + token.start..offset + token.end,
                    removal_replacement: "\"\"",
                    placement: Placement::Single,
                },
            ),
        ));
    }

    found.sort_by_key(|(pos, _)| *pos);
    out.extend(found.into_iter().map(|(_, reference)| reference));
}

fn follows_import(prefix: &str) -> bool {
    let prefix = prefix.trim_end();
    prefix
        .get(prefix.len().saturating_sub("@import".len())..)
        .is_some_and(|tail| tail.eq_ignore_ascii_case("@import"))
}

fn clean_value(raw: &str, in_attribute: bool) -> String {
    let decoded = if in_attribute {
        html_escape::decode_html_entities(raw).into_owned()
    } else {
        raw.to_string()
    };
    decoded.trim().trim_matches(|c| c == '"' || c == '\'').trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::{resolve, DocumentKind};

    fn base() -> Url {
        Url::parse("https://example.com/css/site.css").unwrap()
    }

    #[test]
    fn test_css_background_image_extraction() {
        let css = r#"
            .bg1 { background-image: url('/images/bg1.jpg'); }
            .bg2 { background: url("/images/bg2.jpg"); }
            .bg3 { background-image: url(../images/bg3.jpg); }
            .bg4 { background-color: red; }
            .bg5 { color: blue; }
        "#;
        let refs = resolve(css, &base(), DocumentKind::Stylesheet);

        let urls: Vec<String> = refs.iter().map(|r| r.address.as_ref().unwrap().to_string()).collect();
        assert_eq!(
            urls,
            vec![
                "https://example.com/images/bg1.jpg",
                "https://example.com/images/bg2.jpg",
                "https://example.com/images/bg3.jpg",
            ]
        );
        assert!(refs.iter().all(|r| r.kind == ResourceKind::Image));
    }

    #[test]
    fn test_font_face_sources_are_fonts() {
        let css = r#"
            @font-face {
                font-family: "Brand";
                src: url(../fonts/brand.woff2) format("woff2"), url(../fonts/brand.woff) format("woff");
            }
            .logo { background: url(logo.svg); }
        "#;
        let refs = resolve(css, &base(), DocumentKind::Stylesheet);

        assert_eq!(refs.len(), 3);
        assert_eq!(refs[0].kind, ResourceKind::Font);
        assert_eq!(refs[1].kind, ResourceKind::Font);
        assert_eq!(refs[2].kind, ResourceKind::Image);
        assert_eq!(refs[2].address.as_ref().unwrap().as_str(), "https://example.com/css/logo.svg");
    }

    #[test]
    fn test_imports() {
        let css = r#"@import "reset.css"; @import url(theme.css); body { color: red }"#;
        let refs = resolve(css, &base(), DocumentKind::Stylesheet);

        assert_eq!(refs.len(), 2);
        assert!(refs.iter().all(|r| r.kind == ResourceKind::Stylesheet));
        let first = refs[0].location.as_ref().unwrap();
        assert_eq!(&css[first.value.clone()], "reset.css");
        assert_eq!(&css[first.removal.clone()], "\"reset.css\"");
        let second = refs[1].location.as_ref().unwrap();
        assert_eq!(&css[second.removal.clone()], "url(theme.css)");
    }

    #[test]
    fn test_comments_and_data_uris() {
        let css = r#"/* .old { background: url(old.png) } */
            .icon { background: url(data:image/svg+xml;base64,PHN2Zz4=); }"#;
        let refs = resolve(css, &base(), DocumentKind::Stylesheet);

        assert_eq!(refs.len(), 1);
        assert!(!refs[0].is_fetchable());
    }

    #[test]
    fn test_offsets_are_document_absolute() {
        let owner = Url::parse("https://example.com/").unwrap();
        let text = "prefix.a{background:url(x.png)}";
        let mut out = Vec::new();
        scan_stylesheet(&text[6..], &owner, &owner, 6, false, &mut out);

        let location = out[0].location.as_ref().unwrap();
        assert_eq!(&text[location.value.clone()], "x.png");
        assert_eq!(&text[location.removal.clone()], "url(x.png)");
    }
}
