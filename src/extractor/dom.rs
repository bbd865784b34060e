use scraper::{ElementRef, Html, Selector};
use serde_json::{json, Value};
use tracing::debug;
use url::Url;

// Selector groups are matched in document order, like `querySelectorAll`.
const CONTAINER_SELECTORS: &[&str] = &[
    ".product-grid",
    ".products-grid",
    "[data-test=\"product-grid\"]",
    "[data-test=\"search-results\"]",
];
const PRODUCT_SELECTORS: &[&str] = &[".product", ".product-card", "[data-test=\"product-card\"]"];
const TITLE_SELECTORS: &[&str] = &[".product-title", ".product-name", "[data-test=\"product-title\"]"];
const PRICE_SELECTORS: &[&str] = &[".product-price", "[data-test=\"product-price\"]"];

/// Single pass over the page markup for product cards. Cards without a title
/// are skipped; relative image and link URLs are resolved against `location`.
pub fn extract_from_dom(html: &str, location: &str) -> Vec<Value> {
    let (Some(containers), Some(cards), Some(titles), Some(prices), Some(image), Some(link)) = (
        group(CONTAINER_SELECTORS),
        group(PRODUCT_SELECTORS),
        group(TITLE_SELECTORS),
        group(PRICE_SELECTORS),
        group(&["img"]),
        group(&["a"]),
    ) else {
        return Vec::new();
    };

    let doc = Html::parse_document(html);
    let base = Url::parse(location).ok();
    let mut products = Vec::new();
    let mut found_container = false;

    for container in doc.select(&containers) {
        found_container = true;
        let elements: Vec<ElementRef> = container.select(&cards).collect();
        debug!("Found {} product elements in container", elements.len());

        for card in elements {
            let name = first_text(card, &titles).unwrap_or_default();
            if name.is_empty() {
                continue;
            }
            products.push(json!({
                "name": name,
                "price": first_text(card, &prices).unwrap_or_default(),
                "imageUrl": first_attr(card, &image, "src", base.as_ref()).unwrap_or_default(),
                "url": first_attr(card, &link, "href", base.as_ref()).unwrap_or_default(),
            }));
        }
    }

    if !found_container {
        debug!("No product containers found in DOM");
    }
    products
}

fn group(selectors: &[&str]) -> Option<Selector> {
    Selector::parse(&selectors.join(", ")).ok()
}

fn first_text(el: ElementRef, selector: &Selector) -> Option<String> {
    el.select(selector)
        .next()
        .map(|e| e.text().collect::<Vec<_>>().join(" "))
        .map(|t| t.split_whitespace().collect::<Vec<_>>().join(" "))
}

fn first_attr(el: ElementRef, selector: &Selector, attr: &str, base: Option<&Url>) -> Option<String> {
    let raw = el.select(selector).next()?.value().attr(attr)?.trim();
    match base.and_then(|b| b.join(raw).ok()) {
        Some(resolved) => Some(resolved.to_string()),
        None => Some(raw.to_string()),
    }
}
