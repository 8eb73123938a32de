//! Page rendering: exchange record → standalone HTML document.
//!
//! A page is built in a fixed order:
//!
//! 1. the recovery block, when provenance is supplied
//! 2. the user block, when included and non-empty
//! 3. the model block, when included and it has text or images; the text
//!    comes first, then every image in order
//!
//! This stage only produces markup. Turning it into PDF bytes is the render
//! service's job ([`crate::service`]).

use super::markup::{escape_html, to_markup};
use crate::config::{ArchiveConfig, BodyFormat, HeadingConfig};
use crate::model::{ExchangeRecord, ImageRef, RecoveryInfo};
use crate::style::{html_document, DEFAULT_STYLESHEET};
use std::fmt::Write as _;

const RECOVERY_TITLE: &str = "Recovery Information";

/// Turns exchange records into HTML pages.
#[derive(Debug, Clone)]
pub struct PageRenderer {
    user_format: BodyFormat,
    model_format: BodyFormat,
    stylesheet: String,
    head: String,
}

impl Default for PageRenderer {
    fn default() -> Self {
        Self {
            user_format: BodyFormat::Plain,
            model_format: BodyFormat::Markdown,
            stylesheet: DEFAULT_STYLESHEET.to_string(),
            head: String::new(),
        }
    }
}

impl PageRenderer {
    pub fn new(user_format: BodyFormat, model_format: BodyFormat) -> Self {
        Self {
            user_format,
            model_format,
            ..Self::default()
        }
    }

    pub fn from_config(config: &ArchiveConfig) -> Self {
        let mut renderer = Self::new(config.user_format, config.model_format);
        if let Some(css) = &config.stylesheet {
            renderer = renderer.with_stylesheet(css.clone());
        }
        if let Some(head) = &config.page_head {
            renderer = renderer.with_head(head.clone());
        }
        renderer
    }

    /// Extra `<head>` markup, e.g. KaTeX and mermaid scripts.
    pub fn with_head(mut self, html: impl Into<String>) -> Self {
        self.head = html.into();
        self
    }

    pub fn with_stylesheet(mut self, css: impl Into<String>) -> Self {
        self.stylesheet = css.into();
        self
    }

    /// Body fragment for one exchange.
    pub fn render_fragment(
        &self,
        record: &ExchangeRecord,
        headings: &HeadingConfig,
        recovery: Option<&RecoveryInfo>,
    ) -> String {
        let mut body = String::new();

        if let Some(info) = recovery {
            body.push_str(&recovery_block(info));
        }

        if record.shows_user() {
            body.push_str("<section class=\"user-message\">\n");
            if let Some(heading) = headings.user() {
                let _ = writeln!(body, "<h1>{}</h1>", escape_html(heading));
            }
            body.push_str(&self.body(&record.user_text, self.user_format));
            body.push_str("</section>\n");
        }

        if record.shows_model() {
            body.push_str("<section class=\"model-response\">\n");
            if let Some(heading) = headings.model() {
                let _ = writeln!(body, "<h1>{}</h1>", escape_html(heading));
            }
            if !record.model_text.is_empty() {
                body.push_str(&self.body(&record.model_text, self.model_format));
            }
            for image in &record.model_images {
                body.push_str(&figure(image));
            }
            body.push_str("</section>\n");
        }

        body
    }

    /// Complete HTML document for one exchange.
    pub fn render_exchange(
        &self,
        record: &ExchangeRecord,
        headings: &HeadingConfig,
        recovery: Option<&RecoveryInfo>,
    ) -> String {
        let fragment = self.render_fragment(record, headings, recovery);
        html_document("Exchange", &self.stylesheet, &self.head, &fragment)
    }

    /// Standalone provenance page placed ahead of a file's exchanges.
    pub fn render_recovery(&self, info: &RecoveryInfo) -> String {
        html_document(RECOVERY_TITLE, &self.stylesheet, &self.head, &recovery_block(info))
    }

    fn body(&self, text: &str, format: BodyFormat) -> String {
        match format {
            BodyFormat::Plain => format!("<p>{}</p>\n", to_markup(text, format)),
            BodyFormat::Markdown => to_markup(text, format),
        }
    }
}

fn figure(image: &ImageRef) -> String {
    let alt = image.description.as_deref().unwrap_or("");
    let mut out = format!(
        "<figure><img src=\"{}\" alt=\"{}\">",
        escape_html(&image.data_uri()),
        escape_html(alt)
    );
    if !alt.trim().is_empty() {
        let _ = write!(out, "<figcaption>{}</figcaption>", escape_html(alt));
    }
    out.push_str("</figure>\n");
    out
}

/// Title plus a label/value table of the non-empty fields.
pub fn recovery_block(info: &RecoveryInfo) -> String {
    let mut out = format!("<section class=\"recovery\">\n<h1>{RECOVERY_TITLE}</h1>\n<table>\n");
    for (label, value) in info.rows() {
        let cell = if label == "Link" {
            let escaped = escape_html(value.trim());
            format!("<a href=\"{escaped}\">{escaped}</a>")
        } else {
            escape_html(value).replace('\n', "<br>")
        };
        let _ = writeln!(out, "<tr><th>{label}</th><td>{cell}</td></tr>");
    }
    out.push_str("</table>\n</section>\n");
    out
}
