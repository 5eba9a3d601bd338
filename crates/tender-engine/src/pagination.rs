//! Listing traversal primitives: entering the listing, parsing rows, and the
//! four-way end-of-data check on the "next" control.

use tender_core::{clean_text, PortalConfig, PreStep, TenderDraft};
use tender_driver::{DriverError, DriverResult, Element, Page};
use tracing::{debug, warn};

/// Listing rows alternate these two classes across every portal skin.
pub const ROW_SELECTOR: &str = "tr.even, tr.odd";
pub const NEXT_SELECTOR: &str = "a#linkFwd";

const LISTING_TAB_SCRIPT: &str = "tapestry.form.submit('ListTendersbyDate', 'LinkSubmit_0');";
const LISTING_TAB_FALLBACK: &str = "a#LinkSubmit_0";
const PRE_STEP_SCRIPT: &str = "document.querySelector('.alertbutclose')?.click()";
const PRE_STEP_FALLBACK: &str = ".alertbutclose";

/// The "closing within 7 days" listing entry for a portal.
pub fn listing_url(portal: &PortalConfig) -> String {
    format!(
        "{}?page=FrontEndListTendersbyDate&service=page",
        portal.portal_url
    )
}

/// Outcome of inspecting the pagination control. Different portal skins encode
/// "no more pages" differently, so each absence flavor is detected on its own;
/// only a present, visible, enabled, navigable control advances the crawl.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextControl {
    Absent,
    Hidden,
    Disabled,
    NonNavigable,
    Available { next_url: String },
}

impl NextControl {
    pub fn is_end_of_data(&self) -> bool {
        !matches!(self, Self::Available { .. })
    }

    pub fn reason(&self) -> &'static str {
        match self {
            Self::Absent => "next control not found",
            Self::Hidden => "next control hidden",
            Self::Disabled => "next control disabled",
            Self::NonNavigable => "next control has no navigable target",
            Self::Available { .. } => "available",
        }
    }
}

pub async fn inspect_next_control(
    page: &dyn Page,
    portal: &PortalConfig,
) -> DriverResult<NextControl> {
    let Some(control) = page.query(NEXT_SELECTOR).await? else {
        return Ok(NextControl::Absent);
    };

    if !control.is_visible().await? {
        return Ok(NextControl::Hidden);
    }

    let classes = control.attribute("class").await?.unwrap_or_default();
    let disabled_attr = control.attribute("disabled").await?;
    if classes.to_ascii_lowercase().contains("disabled")
        || disabled_attr.is_some()
        || !control.is_enabled().await?
    {
        return Ok(NextControl::Disabled);
    }

    match control.attribute("href").await?.as_deref() {
        None | Some("") | Some("#") | Some("javascript:void(0)") => Ok(NextControl::NonNavigable),
        Some(href) => Ok(NextControl::Available {
            next_url: portal.absolutize(href),
        }),
    }
}

/// One page's parse result. Structurally broken rows are skipped and counted,
/// never fatal for the page.
#[derive(Debug, Default)]
pub struct PageExtract {
    pub drafts: Vec<TenderDraft>,
    pub skipped_rows: usize,
}

pub async fn extract_rows(
    page: &dyn Page,
    portal: &PortalConfig,
    run_date: &str,
) -> DriverResult<PageExtract> {
    let rows = page.query_all(ROW_SELECTOR).await?;
    let mut extract = PageExtract::default();

    for row in &rows {
        match parse_row(row.as_ref(), portal, run_date).await {
            Ok(Some(draft)) => extract.drafts.push(draft),
            Ok(None) => {
                extract.skipped_rows += 1;
                debug!(portal = %portal.portal_id, "listing row missing expected columns");
            }
            Err(err) => {
                extract.skipped_rows += 1;
                warn!(portal = %portal.portal_id, error = %err, "listing row failed to parse");
            }
        }
    }

    Ok(extract)
}

async fn parse_row(
    row: &dyn Element,
    portal: &PortalConfig,
    run_date: &str,
) -> DriverResult<Option<TenderDraft>> {
    let cells = row.query_all("td").await?;
    if cells.len() < 6 {
        return Ok(None);
    }

    let sequence_no = clean_text(&cells[0].inner_text().await?);
    let published_date = clean_text(&cells[1].inner_text().await?);
    let closing_date = clean_text(&cells[2].inner_text().await?);
    let opening_date = clean_text(&cells[3].inner_text().await?);

    let title_cell = &cells[4];
    let (title_text, detail_url) = match title_cell.query("a").await? {
        Some(link) => {
            let text = clean_text(&link.inner_text().await?);
            let detail_url = link
                .attribute("href")
                .await?
                .map(|href| portal.absolutize(&href))
                .unwrap_or_default();
            (text, detail_url)
        }
        None => {
            let text = title_cell.inner_text().await?;
            let first_line = text.lines().next().map(clean_text).unwrap_or_default();
            (first_line, String::new())
        }
    };

    // The cell's second line is the reference number; keep it with the title
    // the way the portal displays it.
    let raw_cell_text = title_cell.inner_text().await?;
    let ref_no = raw_cell_text
        .lines()
        .nth(1)
        .map(clean_text)
        .unwrap_or_default();
    let title = if ref_no.is_empty() {
        title_text
    } else {
        format!("{title_text}\n{ref_no}")
    };

    let org_chain = clean_text(&cells[5].inner_text().await?);

    Ok(Some(TenderDraft {
        portal_source: portal.display_name.clone(),
        sequence_no,
        published_date,
        closing_date,
        opening_date,
        title,
        org_chain,
        detail_url,
        run_date: run_date.to_string(),
    }))
}

/// Land on the portal, run its pre-navigation step, and open the listing tab.
pub async fn enter_listing(
    page: &mut dyn Page,
    portal: &PortalConfig,
    timeout: std::time::Duration,
) -> DriverResult<()> {
    page.goto(&portal.portal_url, timeout).await?;
    run_pre_step(page, portal).await;
    page.goto(&listing_url(portal), timeout).await?;

    if let Err(err) = page.evaluate(LISTING_TAB_SCRIPT).await {
        debug!(portal = %portal.portal_id, error = %err, "listing tab script failed, trying anchor");
        match page.query(LISTING_TAB_FALLBACK).await? {
            Some(link) => link.click().await?,
            None => {
                return Err(DriverError::Script(
                    "listing tab control not present".to_string(),
                ))
            }
        }
    }
    Ok(())
}

/// Pre-navigation steps are best-effort: a portal that no longer shows its
/// alert overlay must not fail the run.
async fn run_pre_step(page: &dyn Page, portal: &PortalConfig) {
    match portal.pre_step {
        None => {}
        Some(PreStep::CloseAlertDialog) => {
            if page.evaluate(PRE_STEP_SCRIPT).await.is_ok() {
                return;
            }
            match page.query(PRE_STEP_FALLBACK).await {
                Ok(Some(button)) => {
                    if let Err(err) = button.click().await {
                        warn!(portal = %portal.portal_id, error = %err, "alert dialog close click failed");
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(portal = %portal.portal_id, error = %err, "pre-step handling failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;
    use tender_driver::scripted::{ElementScript, PageScript, Script, ScriptedBrowser};
    use tender_driver::Browser;

    fn portal() -> PortalConfig {
        PortalConfig {
            portal_id: "WB".into(),
            display_name: "West Bengal".into(),
            base_url: "https://portal.invalid".into(),
            portal_url: "https://portal.invalid/app".into(),
            pre_step: None,
        }
    }

    fn next_link(extra: impl FnOnce(ElementScript) -> ElementScript) -> ElementScript {
        extra(
            ElementScript::with_text("Next")
                .attr("id", "linkFwd")
                .attr("href", "/app?page=2"),
        )
    }

    fn listing_with_next(next: Option<ElementScript>) -> Script {
        let mut elements = HashMap::new();
        if let Some(next) = next {
            elements.insert(NEXT_SELECTOR.to_string(), vec![next]);
        }
        Script::default().with_page(
            "https://portal.invalid/list",
            PageScript {
                elements,
                ..PageScript::default()
            },
        )
    }

    async fn inspect(script: Script) -> NextControl {
        let browser = ScriptedBrowser::new(script);
        let mut page = browser.new_page().await.expect("page");
        page.goto("https://portal.invalid/list", Duration::from_secs(1))
            .await
            .expect("goto");
        inspect_next_control(&*page, &portal()).await.expect("inspect")
    }

    #[tokio::test]
    async fn absent_control_ends_pagination() {
        assert_eq!(inspect(listing_with_next(None)).await, NextControl::Absent);
    }

    #[tokio::test]
    async fn hidden_control_ends_pagination() {
        let next = next_link(|e| ElementScript { visible: false, ..e });
        assert_eq!(inspect(listing_with_next(Some(next))).await, NextControl::Hidden);
    }

    #[tokio::test]
    async fn disabled_class_ends_pagination() {
        let next = next_link(|e| e.attr("class", "link Disabled"));
        assert_eq!(inspect(listing_with_next(Some(next))).await, NextControl::Disabled);
    }

    #[tokio::test]
    async fn disabled_attribute_ends_pagination() {
        let next = next_link(|e| e.attr("disabled", ""));
        assert_eq!(inspect(listing_with_next(Some(next))).await, NextControl::Disabled);
    }

    #[tokio::test]
    async fn not_enabled_control_ends_pagination() {
        let next = next_link(|e| ElementScript { enabled: false, ..e });
        assert_eq!(inspect(listing_with_next(Some(next))).await, NextControl::Disabled);
    }

    #[tokio::test]
    async fn placeholder_href_ends_pagination() {
        for href in ["", "#", "javascript:void(0)"] {
            let next = next_link(|e| e.attr("href", href));
            assert_eq!(
                inspect(listing_with_next(Some(next))).await,
                NextControl::NonNavigable,
                "href {href:?} must read as end of data"
            );
        }
    }

    #[tokio::test]
    async fn live_control_advances_with_absolute_url() {
        let next = next_link(|e| e);
        assert_eq!(
            inspect(listing_with_next(Some(next))).await,
            NextControl::Available {
                next_url: "https://portal.invalid/app?page=2".to_string()
            }
        );
    }

    fn tender_row(seq: &str, title: &str, href: Option<&str>) -> ElementScript {
        let mut title_cell = ElementScript::with_text(format!("{title}\nREF-{seq}"));
        if let Some(href) = href {
            title_cell = title_cell.child(
                "a",
                ElementScript::with_text(title).attr("href", href),
            );
        }
        ElementScript::default().children(
            "td",
            vec![
                ElementScript::with_text(seq),
                ElementScript::with_text("18-Aug-2026"),
                ElementScript::with_text("22-Aug-2026"),
                ElementScript::with_text("23-Aug-2026"),
                title_cell,
                ElementScript::with_text("PWD||Roads"),
            ],
        )
    }

    #[tokio::test]
    async fn rows_parse_into_drafts_and_broken_rows_are_skipped() {
        let broken = ElementScript::default().children(
            "td",
            vec![
                ElementScript::with_text("2"),
                ElementScript::with_text("19-Aug-2026"),
            ],
        );
        let script = Script::default().with_page(
            "https://portal.invalid/list",
            PageScript {
                elements: HashMap::from([(
                    ROW_SELECTOR.to_string(),
                    vec![
                        tender_row("1", "Road resurfacing", Some("/view?t=1")),
                        broken,
                        tender_row("3", "Bridge painting", None),
                    ],
                )]),
                ..PageScript::default()
            },
        );
        let browser = ScriptedBrowser::new(script);
        let mut page = browser.new_page().await.expect("page");
        page.goto("https://portal.invalid/list", Duration::from_secs(1))
            .await
            .expect("goto");

        let extract = extract_rows(&*page, &portal(), "2026-08-25")
            .await
            .expect("extract");
        assert_eq!(extract.skipped_rows, 1);
        assert_eq!(extract.drafts.len(), 2);

        let first = &extract.drafts[0];
        assert_eq!(first.sequence_no, "1");
        assert_eq!(first.title, "Road resurfacing\nREF-1");
        assert_eq!(first.detail_url, "https://portal.invalid/view?t=1");
        assert_eq!(first.org_chain, "PWD||Roads");

        // No anchor: title from the cell, no detail URL.
        let second = &extract.drafts[1];
        assert_eq!(second.detail_url, "");
        assert_eq!(second.title, "Bridge painting\nREF-3");
    }

    #[tokio::test]
    async fn entering_listing_runs_pre_step_and_tab_script() {
        let portal = PortalConfig {
            pre_step: Some(PreStep::CloseAlertDialog),
            ..portal()
        };
        let script = Script::default()
            .with_page("https://portal.invalid/app", PageScript::default())
            .with_page(listing_url(&portal), PageScript::default());
        let browser = ScriptedBrowser::new(script);
        let mut page = browser.new_page().await.expect("page");

        enter_listing(&mut *page, &portal, Duration::from_secs(1))
            .await
            .expect("enter listing");
        let evaluated = browser.evaluated_scripts();
        assert!(evaluated.iter().any(|s| s.contains("alertbutclose")));
        assert!(evaluated.iter().any(|s| s.contains("tapestry.form.submit")));
    }

    #[tokio::test]
    async fn listing_tab_falls_back_to_anchor_click() {
        let portal = portal();
        let script = Script::default()
            .with_page("https://portal.invalid/app", PageScript::default())
            .with_page(
                listing_url(&portal),
                PageScript {
                    fail_scripts: true,
                    elements: HashMap::from([(
                        LISTING_TAB_FALLBACK.to_string(),
                        vec![ElementScript::with_text("Closing within 7 days")
                            .attr("id", "LinkSubmit_0")],
                    )]),
                    ..PageScript::default()
                },
            );
        let browser = ScriptedBrowser::new(script);
        let mut page = browser.new_page().await.expect("page");

        enter_listing(&mut *page, &portal, Duration::from_secs(1))
            .await
            .expect("enter listing");
        assert_eq!(browser.clicked_elements(), vec!["LinkSubmit_0".to_string()]);
    }
}
