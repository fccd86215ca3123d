use std::{ops::Range, sync::LazyLock};

use regex::Regex;

use crate::{
    models::{GeneratedImage, ImagePlacement},
    web::escape_html,
};

static PARAGRAPH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<p(?:\s[^>]*)?>.*?</p>").expect("paragraph pattern is valid")
});

/// Byte ranges of every top-level `<p>...</p>` element, in document order.
pub fn paragraph_spans(html: &str) -> Vec<Range<usize>> {
    PARAGRAPH_RE.find_iter(html).map(|m| m.range()).collect()
}

pub fn count_paragraphs(html: &str) -> usize {
    PARAGRAPH_RE.find_iter(html).count()
}

/// Insert a `<figure>` after the target paragraph of every successful image.
///
/// `images[i]` belongs to `placements[i]`; `None` slots are skipped. Targets
/// past the last paragraph land after the last paragraph. Insertions are
/// applied from the highest offset down so earlier offsets stay valid, and
/// figures sharing a boundary keep their list order.
pub fn insert_images(
    html: &str,
    placements: &[ImagePlacement],
    images: &[Option<GeneratedImage>],
) -> String {
    let spans = paragraph_spans(html);
    if spans.is_empty() {
        return html.to_string();
    }

    let mut insertions: Vec<(usize, usize, String)> = placements
        .iter()
        .zip(images)
        .enumerate()
        .filter_map(|(idx, (placement, image))| {
            let image = image.as_ref()?;
            let paragraph = placement.insert_after_paragraph.clamp(1, spans.len());
            Some((spans[paragraph - 1].end, idx, render_figure(placement, image)))
        })
        .collect();

    if insertions.is_empty() {
        return html.to_string();
    }

    insertions.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.cmp(&a.1)));

    let mut output = html.to_string();
    for (offset, _, figure) in insertions {
        output.insert_str(offset, &figure);
    }
    output
}

fn render_figure(placement: &ImagePlacement, image: &GeneratedImage) -> String {
    let alt = if placement.description.trim().is_empty() {
        &placement.prompt
    } else {
        &placement.description
    };
    let caption = if placement.description.trim().is_empty() {
        String::new()
    } else {
        format!("<figcaption>{}</figcaption>", escape_html(&placement.description))
    };

    format!(
        r#"<figure class="article-image"><img src="{src}" alt="{alt}" loading="lazy" />{caption}</figure>"#,
        src = escape_html(&image.url),
        alt = escape_html(alt),
    )
}
