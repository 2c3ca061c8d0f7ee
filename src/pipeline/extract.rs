//! HTML extraction driven by recipe selectors.
//!
//! Listing pages yield candidate items; detail pages yield full records
//! with a best-guess media URL picked by a scored-candidate heuristic.

use chrono::Utc;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use std::sync::OnceLock;
use url::Url;

use crate::models::{DetailSelectors, ListingSelectors, Record};

/// A candidate item extracted from a listing page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingItem {
    pub title: String,
    pub title_raw: String,
    pub link: String,
    pub image_url: Option<String>,
}

fn background_image_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)background-image:\s*url\(['"]?(.*?)['"]?\)"#)
            .expect("static background-image regex is valid")
    })
}

fn media_url_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"https?://[^"'\s\\]+\.(?:mp4|m3u8|webm|mov)[^"'\s\\]*"#)
            .expect("static media URL regex is valid")
    })
}

/// Strip recipe noise patterns and typographic quotes from a title.
pub fn clean_title(raw: &str, strip_patterns: &[String]) -> String {
    let mut title = raw.to_string();
    for pattern in strip_patterns {
        if let Ok(re) = Regex::new(pattern) {
            title = re.replace_all(&title, "").to_string();
        }
    }
    title
        .replace(['\u{2018}', '\u{2019}', '\u{201C}', '\u{201D}'], "")
        .trim()
        .to_string()
}

/// Resolve a possibly relative link against the page base and drop the
/// fragment, producing the canonical identity key.
pub fn canonicalize_link(base: &Url, href: &str) -> Option<String> {
    let mut url = base.join(href).ok()?;
    url.set_fragment(None);
    Some(url.to_string())
}

/// Extract candidate items from a listing page.
pub fn extract_listing(
    html: &str,
    selectors: &ListingSelectors,
    base_url: &str,
    strip_patterns: &[String],
) -> Vec<ListingItem> {
    let base = match Url::parse(base_url) {
        Ok(url) => url,
        Err(_) => return Vec::new(),
    };
    let item_selector = match Selector::parse(&selectors.item_selector) {
        Ok(sel) => sel,
        Err(_) => return Vec::new(),
    };
    let title_selector = selectors
        .title_selector
        .as_deref()
        .and_then(|s| Selector::parse(s).ok());

    let document = Html::parse_document(html);
    let mut items = Vec::new();

    for element in document.select(&item_selector) {
        let href = match element.value().attr(&selectors.link_attr) {
            Some(href) => href,
            None => continue,
        };
        let link = match canonicalize_link(&base, href) {
            Some(link) => link,
            None => continue,
        };

        let title_from_attr = selectors
            .title_attr
            .as_deref()
            .and_then(|attr| element.value().attr(attr))
            .unwrap_or("");
        let title_from_child = title_selector
            .as_ref()
            .and_then(|sel| element.select(sel).next())
            .map(|el| el.text().collect::<String>())
            .unwrap_or_default();
        let title_raw = if !title_from_attr.trim().is_empty() {
            title_from_attr.to_string()
        } else {
            title_from_child.trim().to_string()
        };

        let image_url = listing_image(&element, selectors, &base);

        let title = clean_title(&title_raw, strip_patterns);
        items.push(ListingItem {
            title: if title.is_empty() {
                "No Title".to_string()
            } else {
                title
            },
            title_raw,
            link,
            image_url,
        });
    }

    items
}

fn listing_image(
    element: &ElementRef<'_>,
    selectors: &ListingSelectors,
    base: &Url,
) -> Option<String> {
    if let Some(attr) = selectors.image_attr.as_deref() {
        if let Some(value) = element.value().attr(attr) {
            return canonicalize_link(base, value);
        }
    }
    let style = element.value().attr("style")?;
    let captured = background_image_re().captures(style)?.get(1)?.as_str();
    canonicalize_link(base, captured)
}

/// Extract a full record from a detail page.
pub fn extract_detail(
    html: &str,
    item: &ListingItem,
    selectors: &DetailSelectors,
    base_url: &str,
    strip_patterns: &[String],
) -> Record {
    let document = Html::parse_document(html);
    let base = Url::parse(base_url).ok();

    let head_title = select_text(&document, "head title");
    let meta_description = select_attr(&document, r#"meta[name="description"]"#, "content");
    let og_title = select_attr(&document, r#"meta[property="og:title"]"#, "content");
    let og_description = select_attr(&document, r#"meta[property="og:description"]"#, "content");

    let video_url = best_media_url(&document, html, selectors, base.as_ref());
    let image_url = item.image_url.clone().or_else(|| first_image(&document, base.as_ref()));
    let tags = extract_tags(&document, selectors);

    let clean = |s: Option<String>| s.map(|v| clean_title(&v, strip_patterns)).filter(|v| !v.is_empty());

    Record {
        title: clean_title(&item.title_raw, strip_patterns),
        title_raw: item.title_raw.clone(),
        link: item.link.clone(),
        image_url,
        video_url,
        meta_description: clean(meta_description.clone()),
        og_title: clean(og_title.or(head_title)),
        og_description: clean(og_description.or(meta_description)),
        tags,
        published: false,
        fresh: true,
        error: None,
        scraped_at: Utc::now(),
    }
}

fn select_text(document: &Html, selector: &str) -> Option<String> {
    let sel = Selector::parse(selector).ok()?;
    document
        .select(&sel)
        .next()
        .map(|el| el.text().collect::<String>().trim().to_string())
        .filter(|s| !s.is_empty())
}

fn select_attr(document: &Html, selector: &str, attr: &str) -> Option<String> {
    let sel = Selector::parse(selector).ok()?;
    document
        .select(&sel)
        .next()
        .and_then(|el| el.value().attr(attr))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn first_image(document: &Html, base: Option<&Url>) -> Option<String> {
    let sel = Selector::parse("img").ok()?;
    let element = document.select(&sel).next()?;
    let src = element
        .value()
        .attr("src")
        .or_else(|| element.value().attr("data-src"))?;
    match base {
        Some(base) => canonicalize_link(base, src),
        None => Some(src.to_string()),
    }
}

fn extract_tags(document: &Html, selectors: &DetailSelectors) -> Vec<String> {
    let Some(selector) = selectors.tag_selector.as_deref() else {
        return Vec::new();
    };
    let Ok(sel) = Selector::parse(selector) else {
        return Vec::new();
    };
    document
        .select(&sel)
        .map(|el| el.text().collect::<String>().trim().to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

/// Pick the best media URL from a detail page.
///
/// Candidates from the recipe's media selectors are scored: explicit
/// player/video markup beats bare anchors, preview/thumbnail/poster-looking
/// URLs are penalized, and a raw-markup pattern scan is the last resort
/// when structured markup yields nothing.
pub fn best_media_url(
    document: &Html,
    raw_html: &str,
    selectors: &DetailSelectors,
    base: Option<&Url>,
) -> Option<String> {
    let attrs: Vec<&str> = if selectors.media_attrs.is_empty() {
        vec!["src", "data-src"]
    } else {
        selectors.media_attrs.iter().map(|s| s.as_str()).collect()
    };

    let mut best: Option<(i32, String)> = None;

    for (rank, selector) in selectors.media_selectors.iter().enumerate() {
        let Ok(sel) = Selector::parse(selector) else {
            continue;
        };
        for element in document.select(&sel) {
            for attr in &attrs {
                let Some(value) = element.value().attr(attr) else {
                    continue;
                };
                let resolved = match base {
                    Some(base) => match canonicalize_link(base, value) {
                        Some(url) => url,
                        None => continue,
                    },
                    None => value.to_string(),
                };
                // Earlier recipe selectors outrank later ones.
                let score = score_candidate(element.value().name(), &resolved)
                    - (rank as i32) * 5;
                if best.as_ref().map(|(s, _)| score > *s).unwrap_or(true) {
                    best = Some((score, resolved));
                }
            }
        }
    }

    if let Some((score, url)) = &best {
        if *score > 0 {
            return Some(url.clone());
        }
    }

    // Structured markup yielded nothing usable; scan the raw markup text.
    media_url_re()
        .find(raw_html)
        .map(|m| m.as_str().to_string())
        .or(best.map(|(_, url)| url))
}

fn score_candidate(tag: &str, url: &str) -> i32 {
    let mut score = match tag {
        "video" | "source" => 30,
        "iframe" | "embed" => 20,
        "a" => 5,
        _ => 10,
    };

    let lowered = url.to_lowercase();
    if lowered.contains(".mp4") || lowered.contains(".m3u8") || lowered.contains(".webm") {
        score += 10;
    }
    for marker in ["preview", "thumb", "poster", "sprite"] {
        if lowered.contains(marker) {
            score -= 35;
        }
    }
    score
}
