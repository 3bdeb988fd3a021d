use anyhow::{Context, Result, bail};
use serde::Serialize;
use similar::TextDiff;
use tracing::{info, warn};

use crate::batch::{BatchQuery, BatchSource, DraftRow};
use crate::config::BotConfig;
use crate::mediawiki::{EditOutcome, EditRequest, PageWriter};
use crate::suppress::{count_live_categories, suppress_categories};

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub dry_run: bool,
    /// Stop at the first failed page instead of recording it and moving on.
    pub fail_fast: bool,
    pub follow_redirects: bool,
    pub summary: String,
    pub minor: bool,
}

impl RunOptions {
    pub fn from_config(config: &BotConfig, dry_run: bool, fail_fast: bool) -> Self {
        Self {
            dry_run,
            fail_fast,
            follow_redirects: false,
            summary: config.edit_summary().to_string(),
            minor: config.minor(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PageAction {
    Updated,
    Unchanged,
    WouldUpdate,
    Skipped,
    Failed,
}

impl PageAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Updated => "updated",
            Self::Unchanged => "unchanged",
            Self::WouldUpdate => "would_update",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PageOutcome {
    pub title: String,
    pub page_id: i64,
    pub action: PageAction,
    pub suppressed: usize,
    pub detail: Option<String>,
    pub diff: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub success: bool,
    pub dry_run: bool,
    pub aborted: bool,
    pub candidates: usize,
    pub processed: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub would_update: usize,
    pub skipped: usize,
    pub failed: usize,
    pub errors: Vec<String>,
    pub pages: Vec<PageOutcome>,
    pub request_count: usize,
}

impl BatchReport {
    fn new(dry_run: bool, candidates: usize) -> Self {
        Self {
            success: true,
            dry_run,
            aborted: false,
            candidates,
            processed: 0,
            updated: 0,
            unchanged: 0,
            would_update: 0,
            skipped: 0,
            failed: 0,
            errors: Vec::new(),
            pages: Vec::new(),
            request_count: 0,
        }
    }

    fn record(&mut self, outcome: PageOutcome) {
        self.processed += 1;
        match outcome.action {
            PageAction::Updated => self.updated += 1,
            PageAction::Unchanged => self.unchanged += 1,
            PageAction::WouldUpdate => self.would_update += 1,
            PageAction::Skipped => self.skipped += 1,
            PageAction::Failed => self.failed += 1,
        }
        self.pages.push(outcome);
    }
}

/// Load the rows to process, optionally capped at `limit`.
pub fn collect_batch<S: BatchSource + ?Sized>(
    source: &mut S,
    query: &BatchQuery,
    limit: Option<usize>,
) -> Result<Vec<DraftRow>> {
    let mut rows = source
        .fetch_batch(query)
        .with_context(|| format!("failed to load batch from {}", source.describe()))?;
    info!(
        source = %source.describe(),
        category = %query.category,
        rows = rows.len(),
        "loaded batch"
    );
    if let Some(limit) = limit {
        rows.truncate(limit);
    }
    Ok(rows)
}

/// Fetch, transform and (unless dry-running) save every row.
///
/// A failed page is recorded in the report and the loop moves on, unless
/// `fail_fast` is set. Login and missing credentials abort the whole run.
pub fn process_batch<W: PageWriter>(
    api: &mut W,
    rows: &[DraftRow],
    options: &RunOptions,
    credentials: Option<(&str, &str)>,
) -> Result<BatchReport> {
    if !options.dry_run && options.summary.trim().is_empty() {
        bail!("edits require a non-empty summary");
    }

    let mut report = BatchReport::new(options.dry_run, rows.len());
    if rows.is_empty() {
        report.request_count = api.request_count();
        return Ok(report);
    }

    if !options.dry_run {
        let (username, password) = credentials.ok_or_else(|| {
            anyhow::anyhow!("WIKI_BOT_USER and WIKI_BOT_PASS are required outside dry-run mode")
        })?;
        info!(user = username, "logging in to bot account");
        api.login(username, password).context("bot login failed")?;
    }

    for row in rows {
        match process_page(api, row, options) {
            Ok(outcome) => {
                info!(
                    title = %outcome.title,
                    action = outcome.action.as_str(),
                    suppressed = outcome.suppressed,
                    "processed page"
                );
                report.record(outcome);
            }
            Err(error) => {
                let title = row
                    .full_title()
                    .unwrap_or_else(|_| format!("page {}", row.page_id));
                warn!(title = %title, error = %format!("{error:#}"), "page failed");
                report.errors.push(format!("{title}: {error:#}"));
                report.record(PageOutcome {
                    title,
                    page_id: row.page_id,
                    action: PageAction::Failed,
                    suppressed: 0,
                    detail: Some(format!("{error:#}")),
                    diff: None,
                });
                if options.fail_fast {
                    report.aborted = true;
                    break;
                }
            }
        }
    }

    report.request_count = api.request_count();
    report.success = report.failed == 0;
    Ok(report)
}

fn process_page<W: PageWriter>(
    api: &mut W,
    row: &DraftRow,
    options: &RunOptions,
) -> Result<PageOutcome> {
    let title = row.full_title()?;
    let Some(page) = api
        .fetch_page(row.page_id, options.follow_redirects)
        .with_context(|| format!("failed to fetch {title}"))?
    else {
        return Ok(PageOutcome {
            title,
            page_id: row.page_id,
            action: PageAction::Skipped,
            suppressed: 0,
            detail: Some("page is missing or has no readable revision".to_string()),
            diff: None,
        });
    };

    if is_redirect(&page.content) {
        return Ok(PageOutcome {
            title: page.title,
            page_id: row.page_id,
            action: PageAction::Skipped,
            suppressed: 0,
            detail: Some("page is a redirect".to_string()),
            diff: None,
        });
    }

    let suppressed = count_live_categories(&page.content);
    let new_content = suppress_categories(&page.content);
    if new_content == page.content {
        return Ok(PageOutcome {
            title: page.title,
            page_id: row.page_id,
            action: PageAction::Unchanged,
            suppressed: 0,
            detail: Some("no live categories outside exempt markup".to_string()),
            diff: None,
        });
    }

    if options.dry_run {
        let diff = render_diff(&page.title, &page.content, &new_content);
        return Ok(PageOutcome {
            title: page.title,
            page_id: row.page_id,
            action: PageAction::WouldUpdate,
            suppressed,
            detail: None,
            diff: Some(diff),
        });
    }

    let outcome = api
        .edit_page(&EditRequest {
            title: page.title.clone(),
            text: new_content,
            summary: options.summary.clone(),
            minor: options.minor,
            bot: true,
            base_revision_id: Some(page.revision_id),
        })
        .with_context(|| format!("failed to save {}", page.title))?;

    Ok(match outcome {
        EditOutcome::Saved { revision_id } => PageOutcome {
            title: page.title,
            page_id: row.page_id,
            action: PageAction::Updated,
            suppressed,
            detail: revision_id.map(|id| format!("revision {id}")),
            diff: None,
        },
        EditOutcome::NoChange => PageOutcome {
            title: page.title,
            page_id: row.page_id,
            action: PageAction::Unchanged,
            suppressed: 0,
            detail: Some("wiki reported no change".to_string()),
            diff: None,
        },
    })
}

fn is_redirect(content: &str) -> bool {
    content
        .trim_start()
        .get(..9)
        .is_some_and(|head| head.eq_ignore_ascii_case("#REDIRECT"))
}

fn render_diff(title: &str, before: &str, after: &str) -> String {
    let diff = TextDiff::from_lines(before, after);
    diff.unified_diff()
        .context_radius(1)
        .header(&format!("{title} (current)"), &format!("{title} (suppressed)"))
        .to_string()
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};

    use super::{PageAction, RunOptions, collect_batch, is_redirect, process_batch};
    use crate::batch::{BatchQuery, BatchSource, DraftRow};
    use crate::mediawiki::{EditOutcome, EditRequest, PageSource, PageWriter, RemotePage};

    #[derive(Default)]
    struct MockWiki {
        pages: BTreeMap<i64, RemotePage>,
        failing_fetches: BTreeSet<i64>,
        failing_edits: BTreeSet<String>,
        edits: Vec<EditRequest>,
        logged_in: bool,
        reject_login: bool,
        request_count: usize,
    }

    impl MockWiki {
        fn with_page(mut self, page_id: i64, title: &str, content: &str) -> Self {
            self.pages.insert(
                page_id,
                RemotePage {
                    title: title.to_string(),
                    namespace: 118,
                    page_id,
                    revision_id: page_id * 10,
                    timestamp: "2026-03-01T00:00:00Z".to_string(),
                    content: content.to_string(),
                },
            );
            self
        }
    }

    impl PageSource for MockWiki {
        fn fetch_page(
            &mut self,
            page_id: i64,
            _follow_redirects: bool,
        ) -> anyhow::Result<Option<RemotePage>> {
            self.request_count += 1;
            if self.failing_fetches.contains(&page_id) {
                anyhow::bail!("HTTP 503");
            }
            Ok(self.pages.get(&page_id).cloned())
        }

        fn request_count(&self) -> usize {
            self.request_count
        }
    }

    impl PageWriter for MockWiki {
        fn login(&mut self, _username: &str, _password: &str) -> anyhow::Result<()> {
            self.request_count += 1;
            if self.reject_login {
                anyhow::bail!("MediaWiki login failed: WrongPass");
            }
            self.logged_in = true;
            Ok(())
        }

        fn edit_page(&mut self, request: &EditRequest) -> anyhow::Result<EditOutcome> {
            self.request_count += 1;
            if !self.logged_in {
                anyhow::bail!("not logged in");
            }
            if self.failing_edits.contains(&request.title) {
                anyhow::bail!("MediaWiki API error [editconflict]: Edit conflict.");
            }
            self.edits.push(request.clone());
            Ok(EditOutcome::Saved {
                revision_id: Some(9000),
            })
        }
    }

    fn row(page_id: i64, title: &str) -> DraftRow {
        DraftRow {
            page_id,
            namespace: 118,
            title: title.to_string(),
        }
    }

    fn options(dry_run: bool, fail_fast: bool) -> RunOptions {
        RunOptions {
            dry_run,
            fail_fast,
            follow_redirects: false,
            summary: "Disable categories on draft".to_string(),
            minor: true,
        }
    }

    fn sample_wiki() -> MockWiki {
        MockWiki::default()
            .with_page(1, "Draft:Alpha", "Alpha body\n[[Category:Foo]]\n[[Category:Bar]]")
            .with_page(2, "Draft:Beta", "Beta body\n[[Category:Draft]]")
            .with_page(3, "Draft:Gamma", "{{Draft categories|[[Category:Keep]]}}\n[[Category:Gamma]]")
    }

    #[test]
    fn writes_suppressed_text_as_minor_bot_edit() {
        let mut wiki = sample_wiki();
        let rows = vec![row(1, "Alpha"), row(2, "Beta"), row(3, "Gamma")];

        let report = process_batch(&mut wiki, &rows, &options(false, false), Some(("Bot", "pw")))
            .expect("run");

        assert!(report.success);
        assert_eq!(report.candidates, 3);
        assert_eq!(report.updated, 2);
        assert_eq!(report.unchanged, 1);
        assert_eq!(wiki.edits.len(), 2);

        let alpha = &wiki.edits[0];
        assert_eq!(alpha.title, "Draft:Alpha");
        assert_eq!(alpha.text, "Alpha body\n[[:Category:Foo]]\n[[:Category:Bar]]");
        assert_eq!(alpha.summary, "Disable categories on draft");
        assert!(alpha.minor);
        assert!(alpha.bot);
        assert_eq!(alpha.base_revision_id, Some(10));

        assert_eq!(
            wiki.edits[1].text,
            "{{Draft categories|[[Category:Keep]]}}\n[[:Category:Gamma]]"
        );
        assert_eq!(report.pages[0].suppressed, 2);
    }

    #[test]
    fn dry_run_reports_diff_without_login_or_writes() {
        let mut wiki = sample_wiki();
        let rows = vec![row(1, "Alpha"), row(2, "Beta")];

        let report = process_batch(&mut wiki, &rows, &options(true, false), None).expect("run");

        assert!(report.success);
        assert!(report.dry_run);
        assert_eq!(report.would_update, 1);
        assert_eq!(report.unchanged, 1);
        assert!(!wiki.logged_in);
        assert!(wiki.edits.is_empty());

        let alpha = &report.pages[0];
        assert_eq!(alpha.action, PageAction::WouldUpdate);
        let diff = alpha.diff.as_deref().expect("diff");
        assert!(diff.contains("-[[Category:Foo]]"));
        assert!(diff.contains("+[[:Category:Foo]]"));
        assert!(report.pages[1].diff.is_none());
    }

    #[test]
    fn write_mode_requires_credentials() {
        let mut wiki = sample_wiki();
        let error = process_batch(&mut wiki, &[row(1, "Alpha")], &options(false, false), None)
            .expect_err("must fail");
        assert!(error.to_string().contains("WIKI_BOT_USER"));
        assert!(wiki.edits.is_empty());
    }

    #[test]
    fn login_failure_aborts_run() {
        let mut wiki = MockWiki {
            reject_login: true,
            ..sample_wiki()
        };
        let error = process_batch(
            &mut wiki,
            &[row(1, "Alpha")],
            &options(false, false),
            Some(("Bot", "bad")),
        )
        .expect_err("must fail");
        assert!(format!("{error:#}").contains("WrongPass"));
        assert_eq!(wiki.request_count, 1);
    }

    #[test]
    fn failures_are_collected_and_the_batch_continues() {
        let mut wiki = sample_wiki().with_page(4, "Draft:Delta", "Delta body\n[[Category:Foo]]");
        wiki.failing_fetches.insert(1);
        wiki.failing_edits.insert("Draft:Gamma".to_string());
        let rows = vec![row(1, "Alpha"), row(3, "Gamma"), row(4, "Delta")];

        let report = process_batch(&mut wiki, &rows, &options(false, false), Some(("Bot", "pw")))
            .expect("run");

        assert!(!report.success);
        assert!(!report.aborted);
        assert_eq!(report.processed, 3);
        assert_eq!(report.failed, 2);
        assert_eq!(report.updated, 1);
        assert_eq!(report.errors.len(), 2);
        assert!(report.errors[0].starts_with("Draft:Alpha: failed to fetch Draft:Alpha"));
        assert!(report.errors[1].contains("editconflict"));
        assert_eq!(wiki.edits.len(), 1);
        assert_eq!(wiki.edits[0].title, "Draft:Delta");
    }

    #[test]
    fn fail_fast_stops_at_first_failure() {
        let mut wiki = sample_wiki();
        wiki.failing_edits.insert("Draft:Alpha".to_string());
        let rows = vec![row(1, "Alpha"), row(3, "Gamma")];

        let report = process_batch(&mut wiki, &rows, &options(false, true), Some(("Bot", "pw")))
            .expect("run");

        assert!(!report.success);
        assert!(report.aborted);
        assert_eq!(report.processed, 1);
        assert_eq!(report.failed, 1);
        assert!(wiki.edits.is_empty());
    }

    #[test]
    fn missing_pages_and_redirects_are_skipped() {
        let mut wiki = MockWiki::default().with_page(
            5,
            "Draft:Moved",
            "#REDIRECT [[Draft:Elsewhere]]\n[[Category:Foo]]",
        );
        let rows = vec![row(5, "Moved"), row(6, "Gone")];

        let report = process_batch(&mut wiki, &rows, &options(false, false), Some(("Bot", "pw")))
            .expect("run");

        assert!(report.success);
        assert_eq!(report.skipped, 2);
        assert!(wiki.edits.is_empty());
        assert_eq!(report.pages[0].detail.as_deref(), Some("page is a redirect"));
    }

    #[test]
    fn empty_batch_skips_login() {
        let mut wiki = sample_wiki();
        let report =
            process_batch(&mut wiki, &[], &options(false, false), None).expect("empty run");
        assert!(report.success);
        assert_eq!(report.candidates, 0);
        assert!(!wiki.logged_in);
    }

    struct FixedSource(Vec<DraftRow>);

    impl BatchSource for FixedSource {
        fn fetch_batch(&mut self, _query: &BatchQuery) -> anyhow::Result<Vec<DraftRow>> {
            Ok(self.0.clone())
        }

        fn describe(&self) -> String {
            "fixed".to_string()
        }
    }

    #[test]
    fn collect_batch_applies_limit() {
        let mut source = FixedSource(vec![row(1, "Alpha"), row(2, "Beta"), row(3, "Gamma")]);
        let query = BatchQuery {
            category: "AfC_submissions_with_categories".to_string(),
            namespaces: vec![2, 118],
        };
        let rows = collect_batch(&mut source, &query, Some(2)).expect("collect");
        assert_eq!(rows.len(), 2);
        assert_eq!(collect_batch(&mut source, &query, None).expect("collect").len(), 3);
    }

    #[test]
    fn redirect_detection_is_case_insensitive() {
        assert!(is_redirect("#REDIRECT [[Foo]]"));
        assert!(is_redirect("  #redirect[[Foo]]"));
        assert!(!is_redirect("Text mentioning #REDIRECT"));
        assert!(!is_redirect(""));
    }
}
