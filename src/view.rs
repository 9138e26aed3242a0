//! List filtering and search highlighting for task front ends.

use crate::task::{Task, TaskStatus};

/// Status dropdown value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatusFilter {
    #[default]
    All,
    Only(TaskStatus),
}

impl StatusFilter {
    pub fn matches(&self, status: TaskStatus) -> bool {
        match self {
            StatusFilter::All => true,
            StatusFilter::Only(wanted) => *wanted == status,
        }
    }
}

impl std::str::FromStr for StatusFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().eq_ignore_ascii_case("all") {
            return Ok(StatusFilter::All);
        }
        s.parse::<TaskStatus>().map(StatusFilter::Only)
    }
}

/// Status plus free-text search over title and description.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskFilter {
    pub status: StatusFilter,
    pub query: String,
}

impl TaskFilter {
    pub fn new(status: StatusFilter, query: impl Into<String>) -> Self {
        Self {
            status,
            query: query.into(),
        }
    }

    /// Whether anything would be hidden by this filter.
    pub fn is_active(&self) -> bool {
        self.status != StatusFilter::All || !self.query.trim().is_empty()
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn matches(&self, task: &Task) -> bool {
        if !self.status.matches(task.status()) {
            return false;
        }
        let query = self.query.trim().to_lowercase();
        if query.is_empty() {
            return true;
        }
        task.title().to_lowercase().contains(&query)
            || task.description().to_lowercase().contains(&query)
    }

    pub fn apply(&self, tasks: &[Task]) -> Vec<Task> {
        tasks.iter().filter(|t| self.matches(t)).cloned().collect()
    }

    pub fn summarize(&self, tasks: &[Task]) -> ListSummary {
        ListSummary {
            shown: tasks.iter().filter(|t| self.matches(t)).count(),
            total: tasks.len(),
        }
    }
}

/// Header counts, e.g. `Tasks (2 of 5)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListSummary {
    pub shown: usize,
    pub total: usize,
}

impl std::fmt::Display for ListSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Tasks ({} of {})", self.shown, self.total)
    }
}

/// A run of text that either matched the search query or did not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment<'a> {
    pub text: &'a str,
    pub matched: bool,
}

/// Split `text` into matched and unmatched segments.
///
/// Matching is case-insensitive and literal; the query is trimmed the same
/// way [`TaskFilter`] trims it. A blank query yields the whole text.
pub fn highlight<'a>(text: &'a str, query: &str) -> Vec<Segment<'a>> {
    let query = query.trim();
    if query.is_empty() {
        return vec![Segment {
            text,
            matched: false,
        }];
    }

    let mut segments = Vec::new();
    let mut plain_start = 0;
    let mut pos = 0;
    while pos < text.len() {
        if let Some(len) = match_len(&text[pos..], query) {
            if plain_start < pos {
                segments.push(Segment {
                    text: &text[plain_start..pos],
                    matched: false,
                });
            }
            segments.push(Segment {
                text: &text[pos..pos + len],
                matched: true,
            });
            pos += len;
            plain_start = pos;
        } else {
            pos += text[pos..].chars().next().map_or(1, char::len_utf8);
        }
    }
    if plain_start < text.len() || segments.is_empty() {
        segments.push(Segment {
            text: &text[plain_start..],
            matched: false,
        });
    }
    segments
}

/// Byte length of the prefix of `haystack` equal to `needle` ignoring case.
fn match_len(haystack: &str, needle: &str) -> Option<usize> {
    let mut chars = haystack.char_indices();
    for wanted in needle.chars() {
        let (_, found) = chars.next()?;
        if !found.to_lowercase().eq(wanted.to_lowercase()) {
            return None;
        }
    }
    Some(chars.next().map_or(haystack.len(), |(i, _)| i))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample() -> Vec<Task> {
        let mut running = Task::new("Quarterly report", "Collect numbers");
        running.start(Utc::now()).unwrap();
        vec![
            Task::new("Backup", "Nightly REPORT archive"),
            running,
            Task::new("Email", "Send digest"),
        ]
    }

    #[test]
    fn test_search_is_case_insensitive_over_title_and_description() {
        let tasks = sample();
        let filter = TaskFilter::new(StatusFilter::All, "  report ");
        let titles: Vec<&str> = tasks
            .iter()
            .filter(|t| filter.matches(t))
            .map(Task::title)
            .collect();
        assert_eq!(titles, vec!["Backup", "Quarterly report"]);
        assert_eq!(filter.summarize(&tasks).to_string(), "Tasks (2 of 3)");
    }

    #[test]
    fn test_status_and_query_combine() {
        let tasks = sample();
        let mut filter = TaskFilter::new("in-progress".parse().unwrap(), "report");
        assert!(filter.is_active());
        let shown = filter.apply(&tasks);
        assert_eq!(shown.len(), 1);
        assert_eq!(shown[0].title(), "Quarterly report");

        filter.clear();
        assert!(!filter.is_active());
        assert_eq!(filter.apply(&tasks).len(), 3);
    }

    #[test]
    fn test_status_filter_parse() {
        assert_eq!("ALL".parse::<StatusFilter>(), Ok(StatusFilter::All));
        assert_eq!(
            "paused".parse::<StatusFilter>(),
            Ok(StatusFilter::Only(TaskStatus::Paused))
        );
        assert!("stuck".parse::<StatusFilter>().is_err());
    }

    fn marked(segments: &[Segment<'_>]) -> String {
        segments
            .iter()
            .map(|s| {
                if s.matched {
                    format!("[{}]", s.text)
                } else {
                    s.text.to_string()
                }
            })
            .collect()
    }

    #[test]
    fn test_highlight_mixed_case_every_occurrence() {
        let segments = highlight("Report: the REPORT was reported", "report");
        assert_eq!(
            marked(&segments),
            "[Report]: the [REPORT] was [report]ed"
        );
        assert_eq!(segments.iter().filter(|s| s.matched).count(), 3);
    }

    #[test]
    fn test_highlight_treats_query_literally() {
        assert_eq!(
            marked(&highlight("cost (USD) is $5.00+tax", "(usd)")),
            "cost [(USD)] is $5.00+tax"
        );
        assert_eq!(marked(&highlight("a.b acb", ".")), "a[.]b acb");
        assert_eq!(marked(&highlight("x+y*z", "+y*")), "x[+y*]z");
        assert_eq!(marked(&highlight("nothing here", "[a-z]")), "nothing here");
    }

    #[test]
    fn test_highlight_blank_query_returns_whole_text() {
        assert_eq!(
            highlight("Backup", "   "),
            vec![Segment {
                text: "Backup",
                matched: false
            }]
        );
        assert_eq!(marked(&highlight("", "x")), "");
    }

    #[test]
    fn test_highlight_handles_multibyte_text() {
        assert_eq!(marked(&highlight("Überblick über", "ÜBER")), "[Über]blick [über]");
    }
}
