//! Parser for `git status --porcelain=v2 -b`.

/// Facts extracted from one worktree's status output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusSummary {
    pub branch: String,
    /// Empty when no upstream is configured.
    pub upstream: String,
    /// Abbreviated (7 character) HEAD hash; empty before the first commit.
    pub head: String,
    pub dirty: bool,
    pub staged: usize,
    pub unstaged: usize,
    pub untracked: usize,
    pub unmerged: usize,
    pub ahead: usize,
    pub behind: usize,
}

impl StatusSummary {
    pub fn has_upstream(&self) -> bool {
        !self.upstream.is_empty()
    }

    /// Parse porcelain v2 output. `fallback_branch` is used when the header
    /// reports a detached or unknown HEAD.
    pub fn parse(output: &str, fallback_branch: &str) -> Self {
        let mut summary = StatusSummary {
            branch: fallback_branch.to_string(),
            ..Default::default()
        };

        for line in output.lines() {
            if line.is_empty() {
                continue;
            }

            if let Some(header) = line.strip_prefix("# ") {
                summary.apply_header(header);
                continue;
            }

            if line.starts_with("? ") {
                summary.untracked += 1;
                summary.dirty = true;
                continue;
            }

            if line.starts_with("u ") {
                summary.unmerged += 1;
                summary.dirty = true;
                continue;
            }

            // Ordinary (1) and renamed/copied (2) entries carry an XY column.
            if line.starts_with("1 ") || line.starts_with("2 ") {
                let xy = line.split_whitespace().nth(1).unwrap_or_default().as_bytes();
                if let [x, y, ..] = xy {
                    if *x != b'.' {
                        summary.staged += 1;
                    }
                    if *y != b'.' {
                        summary.unstaged += 1;
                    }
                    if *x != b'.' || *y != b'.' {
                        summary.dirty = true;
                    }
                }
                continue;
            }

            // Anything unrecognized is treated as a change.
            summary.dirty = true;
        }

        summary
    }

    fn apply_header(&mut self, header: &str) {
        let fields: Vec<&str> = header.split_whitespace().collect();
        let [key, value, rest @ ..] = fields.as_slice() else {
            return;
        };
        match *key {
            "branch.oid" if *value != "(initial)" => {
                self.head = value.chars().take(7).collect();
            }
            "branch.head" if *value != "(detached)" && *value != "(unknown)" => {
                self.branch = value.to_string();
            }
            "branch.upstream" if *value != "(unknown)" => {
                self.upstream = value.to_string();
            }
            "branch.ab" => {
                for field in std::iter::once(value).chain(rest) {
                    if let Some(n) = field.strip_prefix('+') {
                        self.ahead = parse_count(n);
                    } else if let Some(n) = field.strip_prefix('-') {
                        self.behind = parse_count(n);
                    }
                }
            }
            _ => {}
        }
    }
}

/// Parse a count, clamping negatives and garbage to zero.
fn parse_count(value: &str) -> usize {
    value
        .parse::<i64>()
        .ok()
        .and_then(|n| usize::try_from(n).ok())
        .unwrap_or(0)
}
