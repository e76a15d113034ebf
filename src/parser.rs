//! HTML card parsing and retweet classification for weibo.cn pages.
//!
//! A "card" is one `div.c[id]` fragment representing a single post, taken
//! from either a paginated list page or a per-post detail page. The mobile
//! site renders everything as dense HTML with Chinese UI markers; the
//! classifier keys off those markers plus the card's structure.
//!
//! All functions here are pure and synchronous: callers parse a response
//! body with [`scraper::Html`], hand fragments in, and get owned data back
//! before any further I/O.

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::node::Node;
use scraper::{ElementRef, Html, Selector};

use crate::db::RetweetCategory;

static CONTENT_SELECTOR: Lazy<Selector> = Lazy::new(|| Selector::parse("span.ctt").unwrap());
static BANNER_SELECTOR: Lazy<Selector> = Lazy::new(|| Selector::parse("span.cmt").unwrap());
static ANCHOR_SELECTOR: Lazy<Selector> = Lazy::new(|| Selector::parse("a").unwrap());
static IMG_SELECTOR: Lazy<Selector> = Lazy::new(|| Selector::parse("img").unwrap());

/// "read more" anchor label on truncated posts.
const READ_MORE: &str = "全文";

static RE_FORWARD_AUTHOR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"转发了\s*@(\S+)\s*的微博").unwrap());
static RE_FORWARD_REASON_INLINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"转发理由[:：]\s*(.+)").unwrap());
static RE_DATE_TAIL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\d{1,2}月\d{1,2}日|\d{4}-\d{2}-\d{2})\s+\d{1,2}:\d{2}.*$").unwrap()
});
static RE_WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Evidence recorded alongside a forward decision, retained for offline audit.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct ForwardMeta {
    pub is_forward: bool,
    pub has_forward_phrase: bool,
    pub has_reason_marker: bool,
    pub has_original_forward_marker: bool,
    pub forwarded_author: String,
    pub forward_reason: String,
    pub banner_text: String,
}

/// Outcome of classifying a detail-page card.
#[derive(Debug, Clone)]
pub struct Classification {
    pub category: RetweetCategory,
    pub is_retweet: bool,
    pub forward: ForwardMeta,
}

/// First content node (`span.ctt`) of a card, if any.
#[must_use]
pub fn content_node<'a>(card: ElementRef<'a>) -> Option<ElementRef<'a>> {
    card.select(&CONTENT_SELECTOR).next()
}

/// True iff the content node carries a "read more" anchor, i.e. the
/// list-view text was clipped and a detail fetch is needed.
#[must_use]
pub fn detect_truncated(content: ElementRef<'_>) -> bool {
    content
        .select(&ANCHOR_SELECTOR)
        .any(|a| a.text().collect::<String>().trim() == READ_MORE)
}

/// Extract both a plain-text and a markup-preserving rendering of a content
/// node. The site's own "read more" anchor is dropped, remaining inline
/// links are retargeted to open in a new context, and a single leading `:`
/// artifact (injected before quoted text) is stripped from both renderings.
#[must_use]
pub fn extract_text_and_markup(content: ElementRef<'_>) -> (String, String) {
    let mut text = String::new();
    let mut html = String::new();

    for child in content.children() {
        match child.value() {
            Node::Text(t) => {
                text.push_str(t);
                html.push_str(&escape_html(t));
            }
            Node::Element(el) => {
                let Some(elem) = ElementRef::wrap(child) else {
                    continue;
                };
                let label: String = elem.text().collect();
                if el.name() == "a" {
                    if label.trim() == READ_MORE {
                        continue;
                    }
                    let href = el.attr("href").unwrap_or_default();
                    html.push_str(&format!(
                        "<a href=\"{}\" target=\"_blank\" rel=\"noreferrer\">{}</a>",
                        escape_html(href),
                        elem.inner_html()
                    ));
                } else {
                    html.push_str(&elem.html());
                }
                text.push_str(&label);
            }
            _ => {}
        }
    }

    let text = strip_leading_colon(text.trim());
    let html = strip_leading_colon(html.trim());
    (text, html)
}

fn strip_leading_colon(s: &str) -> String {
    s.strip_prefix(':')
        .map_or_else(|| s.to_string(), |rest| rest.trim_start().to_string())
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// All visible text of a card joined with single spaces.
fn card_text(card: ElementRef<'_>) -> String {
    let pieces: Vec<&str> = card
        .text()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();
    pieces.join(" ")
}

/// Recognize a forward/retweet action from a card's markers and structure.
///
/// Any of these counts: an explicit "forwarded X's post" phrase, a
/// "forward reason:" marker, an "original-forward"/"original-comment"
/// marker, the bare "repost" placeholder, or two or more independent
/// content nodes inside one card (a strong structural signal of quoted
/// content — a heuristic, not a proven invariant).
#[must_use]
pub fn classify_forward(card: ElementRef<'_>) -> ForwardMeta {
    let text = card_text(card);
    let content_nodes = card.select(&CONTENT_SELECTOR).count();
    let banner_text = card
        .select(&BANNER_SELECTOR)
        .next()
        .map(|b| card_text(b))
        .unwrap_or_default();

    let has_forward_phrase = text.contains("转发了") || banner_text.contains("转发了");
    let has_reason_marker = text.contains("转发理由:") || text.contains("转发理由：");
    let has_original_forward_marker = text.contains("原文转发") || text.contains("原文评论");
    let has_original_marker = text.contains("原文:") || text.trim() == "转发微博";

    let is_forward = has_forward_phrase
        || has_reason_marker
        || has_original_forward_marker
        || has_original_marker
        || content_nodes >= 2;

    let forwarded_author = RE_FORWARD_AUTHOR
        .captures(&text)
        .map(|c| format!("@{}", &c[1]))
        .unwrap_or_default();

    let forward_reason = if has_reason_marker {
        RE_FORWARD_REASON_INLINE
            .captures(&text)
            .map(|c| c[1].trim().to_string())
            .unwrap_or_default()
    } else {
        String::new()
    };

    ForwardMeta {
        is_forward,
        has_forward_phrase,
        has_reason_marker,
        has_original_forward_marker,
        forwarded_author,
        forward_reason,
        banner_text,
    }
}

/// Extract the forwarder's own commentary from a *detail* page card.
///
/// Only fires when the explicit "forward reason:" marker is present, so the
/// quoted original is never mistaken for self-written commentary. The text
/// runs from the marker to the next structural marker or end of card, with
/// trailing timestamps and UI action labels trimmed off. Returns the text
/// and its length in chars; the length feeds the long-comment tie-break.
#[must_use]
pub fn extract_forward_reason_from_detail(card: ElementRef<'_>) -> (String, usize) {
    let pieces: Vec<&str> = card
        .text()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();
    let text = pieces.join("\n");

    let start = ["转发理由:", "转发理由："]
        .iter()
        .filter_map(|marker| text.find(marker).map(|i| i + marker.len()))
        .min();
    let Some(start) = start else {
        return (String::new(), 0);
    };

    let rest = &text[start..];
    let end = ["原文:", "原文转发", "原文评论"]
        .iter()
        .filter_map(|marker| rest.find(marker))
        .min()
        .unwrap_or(rest.len());

    let reason = clean_text(&rest[..end]);
    let reason = trim_tail_noise(&reason);
    let len = reason.chars().count();
    (reason, len)
}

fn clean_text(s: &str) -> String {
    let s = s.trim().replace(READ_MORE, "");
    RE_WHITESPACE.replace_all(s.trim(), " ").into_owned()
}

/// Drop timestamp and "report/favorite/actions" tails the site appends
/// after the commentary on detail pages.
fn trim_tail_noise(s: &str) -> String {
    let mut s = RE_DATE_TAIL.replace(s.trim(), "").trim().to_string();
    for kw in ["举报", "收藏", "操作"] {
        if let Some(idx) = s.find(kw) {
            s.truncate(idx);
            s = s.trim().to_string();
        }
    }
    s
}

/// Classify a detail-page card into the authoritative three-way category.
///
/// A forward whose extracted commentary exceeds `threshold` chars is
/// reclassified as a long comment — substantively original content, not a
/// bare retweet. Below the threshold it stays a retweet; a card with no
/// forward signal at all is original.
#[must_use]
pub fn classify_detail_card(card: ElementRef<'_>, threshold: usize) -> Classification {
    let forward = classify_forward(card);
    if forward.is_forward {
        let (_, reason_len) = extract_forward_reason_from_detail(card);
        if reason_len > threshold {
            Classification {
                category: RetweetCategory::LongComment,
                is_retweet: false,
                forward,
            }
        } else {
            Classification {
                category: RetweetCategory::Retweet,
                is_retweet: true,
                forward,
            }
        }
    } else {
        Classification {
            category: RetweetCategory::Original,
            is_retweet: false,
            forward,
        }
    }
}

/// Conservative text-only heuristic for filling a missing retweet flag on
/// posts that are already enriched, without any network call.
#[must_use]
pub fn classify_from_text_heuristic(text: &str) -> (bool, RetweetCategory) {
    let t = text.trim();
    if t.is_empty() {
        return (false, RetweetCategory::OriginalHeuristic);
    }
    if t.contains("转发理由") || t.contains("转发了") || t.starts_with("转发微博") {
        return (true, RetweetCategory::RetweetHeuristic);
    }
    if t.contains("//@") {
        return (true, RetweetCategory::RetweetHeuristic);
    }
    (false, RetweetCategory::OriginalHeuristic)
}

/// Extract post image URLs from a page, normalized to the "large" size
/// variant, with UI-chrome assets filtered out and duplicates (by filename
/// stem) removed. Order follows document order.
#[must_use]
pub fn extract_image_urls(doc: &Html) -> Vec<String> {
    let mut urls = Vec::new();
    let mut seen_stems = std::collections::HashSet::new();

    let mut add_url = |raw: &str, urls: &mut Vec<String>| {
        if raw.is_empty() || !raw.contains("sinaimg.cn") {
            return;
        }
        let large = raw
            .replace("/wap180/", "/large/")
            .replace("/thumb180/", "/large/")
            .replace("/orj360/", "/large/");
        // Only the "large" image host carries post media; everything else is
        // emoji, buttons, and other site chrome.
        if !large.contains("/large/") {
            return;
        }
        if ["/emoticon/", "donate_btn", "/upload/2016/05/26/319/"]
            .iter()
            .any(|chrome| large.contains(chrome))
        {
            return;
        }
        let Some(file) = large.rsplit('/').next() else {
            return;
        };
        let stem = file.split('.').next().unwrap_or(file).to_string();
        if stem.is_empty() || !seen_stems.insert(stem) {
            return;
        }
        let with_ext = if [".jpg", ".jpeg", ".png", ".gif"]
            .iter()
            .any(|ext| large.ends_with(ext))
        {
            large
        } else {
            format!("{large}.jpg")
        };
        urls.push(with_ext);
    };

    for img in doc.select(&IMG_SELECTOR) {
        add_url(img.value().attr("src").unwrap_or_default(), &mut urls);
    }

    // "original picture" anchors carry the picture id in a `u` parameter.
    for link in doc.select(&ANCHOR_SELECTOR) {
        let href = link.value().attr("href").unwrap_or_default();
        if !href.contains("oripic") {
            continue;
        }
        if let Some(raw_id) = href.split("&u=").nth(1) {
            let pic_id = raw_id.split('&').next().unwrap_or(raw_id);
            add_url(
                &format!("https://wx1.sinaimg.cn/large/{pic_id}"),
                &mut urls,
            );
        }
    }

    urls
}

/// Content-level anti-bot detection: a 200 body that is actually a
/// CAPTCHA/"too frequent" interstitial.
#[must_use]
pub fn body_is_antibot_page(body: &str) -> bool {
    ["验证码", "请输入验证码", "访问过于频繁", "请稍后再试"]
        .iter()
        .any(|marker| body.contains(marker))
}

/// Terminal content state: the detail page reports the post was deleted or
/// never existed. Such posts are marked permanently missing and never
/// retried.
#[must_use]
pub fn body_reports_missing(body: &str) -> bool {
    let lower = body.to_lowercase();
    lower.contains("does not exist")
        || [
            "微博不存在",
            "该微博不存在",
            "此微博不存在",
            "该微博已被删除",
            "此微博已被删除",
            "已被作者删除",
        ]
        .iter()
        .any(|marker| body.contains(marker))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_card(html: &str) -> Html {
        Html::parse_fragment(html)
    }

    fn first_card(doc: &Html) -> ElementRef<'_> {
        let sel = Selector::parse("div.c").unwrap();
        doc.select(&sel).next().expect("card")
    }

    #[test]
    fn detects_truncated_content() {
        let doc = parse_card(
            r#"<div class="c" id="M_1"><span class="ctt">clipped text... <a href="/detail">全文</a></span></div>"#,
        );
        let content = content_node(first_card(&doc)).unwrap();
        assert!(detect_truncated(content));
    }

    #[test]
    fn not_truncated_without_read_more() {
        let doc =
            parse_card(r#"<div class="c" id="M_1"><span class="ctt">short post</span></div>"#);
        let content = content_node(first_card(&doc)).unwrap();
        assert!(!detect_truncated(content));
    }

    #[test]
    fn extract_text_strips_read_more_and_retargets_links() {
        let doc = parse_card(
            r#"<div class="c" id="M_1"><span class="ctt">hello <a href="https://t.cn/x">link</a> world <a href="/d">全文</a></span></div>"#,
        );
        let content = content_node(first_card(&doc)).unwrap();
        let (text, html) = extract_text_and_markup(content);
        assert_eq!(text, "hello link world");
        assert!(html.contains(r#"target="_blank""#));
        assert!(html.contains(r#"rel="noreferrer""#));
        assert!(!html.contains(READ_MORE));
    }

    #[test]
    fn extract_text_strips_leading_colon_artifact() {
        let doc = parse_card(r#"<div class="c" id="M_1"><span class="ctt">: quoted text</span></div>"#);
        let content = content_node(first_card(&doc)).unwrap();
        let (text, html) = extract_text_and_markup(content);
        assert_eq!(text, "quoted text");
        assert_eq!(html, "quoted text");
    }

    #[test]
    fn forward_phrase_is_detected_with_author() {
        let doc = parse_card(
            r#"<div class="c" id="M_1"><span class="cmt">转发了 @some_user 的微博</span><span class="ctt">body</span></div>"#,
        );
        let meta = classify_forward(first_card(&doc));
        assert!(meta.is_forward);
        assert!(meta.has_forward_phrase);
        assert_eq!(meta.forwarded_author, "@some_user");
    }

    #[test]
    fn bare_repost_placeholder_is_forward() {
        let doc =
            parse_card(r#"<div class="c" id="M_1"><span class="ctt">转发微博</span></div>"#);
        let meta = classify_forward(first_card(&doc));
        assert!(meta.is_forward);
    }

    #[test]
    fn two_content_nodes_signal_forward() {
        let doc = parse_card(
            r#"<div class="c" id="M_1"><span class="ctt">quoted original</span><span class="ctt">my comment</span></div>"#,
        );
        let meta = classify_forward(first_card(&doc));
        assert!(meta.is_forward);
        assert!(!meta.has_forward_phrase);
    }

    #[test]
    fn plain_post_is_not_forward() {
        let doc = parse_card(
            r#"<div class="c" id="M_1"><span class="ctt">just my own words here</span></div>"#,
        );
        let meta = classify_forward(first_card(&doc));
        assert!(!meta.is_forward);
    }

    #[test]
    fn forward_reason_extracted_between_markers() {
        let doc = parse_card(
            r#"<div class="c" id="M_1"><span class="cmt">转发理由:</span><span class="ctt">就是这样</span><div>原文:完全不同的内容</div></div>"#,
        );
        let (reason, len) = extract_forward_reason_from_detail(first_card(&doc));
        assert_eq!(reason, "就是这样");
        assert_eq!(len, 4);
    }

    #[test]
    fn forward_reason_absent_without_marker() {
        let doc = parse_card(
            r#"<div class="c" id="M_1"><span class="ctt">原文内容很长但没有理由标记</span></div>"#,
        );
        let (reason, len) = extract_forward_reason_from_detail(first_card(&doc));
        assert!(reason.is_empty());
        assert_eq!(len, 0);
    }

    #[test]
    fn forward_reason_trims_ui_tail() {
        let doc = parse_card(
            r#"<div class="c" id="M_1"><span class="cmt">转发理由: 不错 举报 收藏</span></div>"#,
        );
        let (reason, _) = extract_forward_reason_from_detail(first_card(&doc));
        assert_eq!(reason, "不错");
    }

    #[test]
    fn tie_break_long_reason_becomes_long_comment() {
        let reason: String = std::iter::repeat('评').take(150).collect();
        let html = format!(
            r#"<div class="c" id="M_1"><span class="cmt">转发理由:{reason}</span><div>原文:被转发的内容</div></div>"#
        );
        let doc = parse_card(&html);
        let c = classify_detail_card(first_card(&doc), 100);
        assert_eq!(c.category, RetweetCategory::LongComment);
        assert!(!c.is_retweet);
    }

    #[test]
    fn tie_break_short_reason_stays_retweet() {
        let reason: String = std::iter::repeat('评').take(50).collect();
        let html = format!(
            r#"<div class="c" id="M_1"><span class="cmt">转发理由:{reason}</span><div>原文:被转发的内容</div></div>"#
        );
        let doc = parse_card(&html);
        let c = classify_detail_card(first_card(&doc), 100);
        assert_eq!(c.category, RetweetCategory::Retweet);
        assert!(c.is_retweet);
    }

    #[test]
    fn no_forward_signal_is_original() {
        let doc = parse_card(
            r#"<div class="c" id="M_1"><span class="ctt">今天天气不错</span></div>"#,
        );
        let c = classify_detail_card(first_card(&doc), 100);
        assert_eq!(c.category, RetweetCategory::Original);
        assert!(!c.is_retweet);
    }

    #[test]
    fn image_urls_normalized_to_large_and_deduped() {
        let doc = Html::parse_document(
            r#"<html><body>
                <img src="https://wx2.sinaimg.cn/wap180/abc123.jpg">
                <img src="https://wx2.sinaimg.cn/orj360/abc123.jpg">
                <img src="https://wx2.sinaimg.cn/thumb180/def456">
                <img src="https://h5.sinaimg.cn/upload/2016/05/26/319/donate_btn_s.png">
                <img src="https://example.com/other.jpg">
            </body></html>"#,
        );
        let urls = extract_image_urls(&doc);
        assert_eq!(
            urls,
            vec![
                "https://wx2.sinaimg.cn/large/abc123.jpg".to_string(),
                "https://wx2.sinaimg.cn/large/def456.jpg".to_string(),
            ]
        );
    }

    #[test]
    fn image_urls_from_oripic_anchors() {
        let doc = Html::parse_document(
            r#"<html><body><a href="/mblog/oripic?id=xyz&u=pic789&rl=1">原图</a></body></html>"#,
        );
        let urls = extract_image_urls(&doc);
        assert_eq!(urls, vec!["https://wx1.sinaimg.cn/large/pic789.jpg".to_string()]);
    }

    #[test]
    fn emoticon_assets_filtered() {
        let doc = Html::parse_document(
            r#"<html><body><img src="https://h5.sinaimg.cn/m/emoticon/icon/default/d_smile.png"></body></html>"#,
        );
        assert!(extract_image_urls(&doc).is_empty());
    }

    #[test]
    fn text_heuristic_spots_forward_markers() {
        assert!(classify_from_text_heuristic("转发微博").0);
        assert!(classify_from_text_heuristic("挺好的 //@别人: 原话").0);
        assert!(classify_from_text_heuristic("转发了 @abc 的微博").0);
        assert!(!classify_from_text_heuristic("我自己写的内容").0);
        assert!(!classify_from_text_heuristic("").0);
    }

    #[test]
    fn antibot_page_markers_detected() {
        assert!(body_is_antibot_page("<html>请输入验证码</html>"));
        assert!(body_is_antibot_page("访问过于频繁，请稍后再试"));
        assert!(!body_is_antibot_page("<html>正常内容</html>"));
    }

    #[test]
    fn missing_markers_detected() {
        assert!(body_reports_missing("Sorry, this weibo Does Not Exist"));
        assert!(body_reports_missing("该微博已被删除"));
        assert!(!body_reports_missing("正常微博内容"));
    }
}
