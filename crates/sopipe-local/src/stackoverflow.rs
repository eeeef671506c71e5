//! Question/answer extraction from Stack Overflow question pages.

use sopipe_core::{ExtractedSource, Extraction, FetchBackend, FetchRequest, Result};

pub const TITLE_SELECTOR: &str = "h1.fs-headline1";
pub const POST_BODY_SELECTOR: &str = "div.js-post-body";
pub const FALLBACK_TITLE: &str = "No Title";

fn element_text(el: &html_scraper::ElementRef) -> String {
    el.text().collect::<String>()
}

/// Pull the title, question body and best-answer body out of a question page.
///
/// The first post body is the question and the second the top answer; pages with fewer than two
/// bodies (closed, deleted, login walls) yield `NotFound`.
pub fn extract_source(html: &str, url: &str) -> Extraction {
    let doc = html_scraper::Html::parse_document(html);

    let title = html_scraper::Selector::parse(TITLE_SELECTOR)
        .ok()
        .and_then(|sel| doc.select(&sel).next().map(|el| element_text(&el)))
        .map(|t| t.trim().to_string())
        .unwrap_or_else(|| FALLBACK_TITLE.to_string());

    let Ok(body_sel) = html_scraper::Selector::parse(POST_BODY_SELECTOR) else {
        return Extraction::NotFound;
    };
    let mut bodies = doc.select(&body_sel);
    let (Some(question), Some(answer)) = (bodies.next(), bodies.next()) else {
        return Extraction::NotFound;
    };

    Extraction::Found(ExtractedSource {
        title,
        url: url.to_string(),
        question: element_text(&question),
        answer: element_text(&answer),
    })
}

/// GET `url` as HTML and extract it. Transport failures are errors; a missing structure is not.
pub async fn fetch_source(fetcher: &dyn FetchBackend, url: &str) -> Result<Extraction> {
    let resp = fetcher.fetch(&FetchRequest::html(url)).await?;
    let html = resp.text_lossy();
    let out = extract_source(&html, url);
    if out == Extraction::NotFound {
        tracing::debug!(url, status = resp.status, "no question/answer structure; skipping");
    }
    Ok(out)
}
