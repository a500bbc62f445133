//! Colored stderr output.
//!
//! Rendered HTML goes to stdout; everything meant for the person at the
//! terminal goes through [`Output`] so it never mixes with the page.

use console::{Style, Term};

/// Width of the rule printed before a section heading.
const RULE_WIDTH: usize = 70;

/// Styled writer on stderr.
pub(crate) struct Output {
    term: Term,
    ok: Style,
    warn: Style,
    fail: Style,
    heading: Style,
}

impl Output {
    #[must_use]
    pub(crate) fn new() -> Self {
        Self {
            term: Term::stderr(),
            ok: Style::new().green(),
            warn: Style::new().yellow(),
            fail: Style::new().red().bold(),
            heading: Style::new().cyan().bold(),
        }
    }

    fn line(&self, msg: &str) {
        // Best effort.
        let _ = self.term.write_line(msg);
    }

    fn styled(&self, style: &Style, msg: &str) {
        self.line(&style.apply_to(msg).to_string());
    }

    pub(crate) fn info(&self, msg: &str) {
        self.line(msg);
    }

    pub(crate) fn success(&self, msg: &str) {
        self.styled(&self.ok, msg);
    }

    pub(crate) fn warning(&self, msg: &str) {
        self.styled(&self.warn, msg);
    }

    pub(crate) fn error(&self, msg: &str) {
        self.styled(&self.fail, msg);
    }

    /// Print a rule followed by a section heading.
    pub(crate) fn section(&self, title: &str) {
        self.line(&"-".repeat(RULE_WIDTH));
        self.styled(&self.heading, title);
    }
}
