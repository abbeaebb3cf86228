//! Rolling-buffer prompt classifier
//!
//! Output arrives in arbitrary chunks, so a prompt may be split across
//! several reads. Each task keeps a bounded buffer of its recent clean
//! output; after every chunk the adapter's patterns are tested against the
//! whole buffer and the first match names the task's current state.
//!
//! The buffer logic is a pure function ([`append`]) so it can be tested
//! without any process I/O. [`OutputClassifier`] adds the "only report a
//! state once" bookkeeping on top.
//!
//! After a reply the answered prompt stays suppressed: agents commonly
//! redraw the prompt line with the echoed answer. Detection re-arms once a
//! different pattern matches, or a completed non-blank line arrives that
//! the answered pattern does not match.

use crate::catalog::CompiledPattern;

/// Marker in a state name that means "the agent is asking something"
pub const INTERACTION_MARKER: &str = "interaction";

/// Append `chunk` to `buffer`, normalising line endings and keeping at most
/// `capacity` bytes (oldest output dropped first, on a char boundary).
pub fn append(buffer: &str, chunk: &str, capacity: usize) -> String {
    let normalized = chunk.replace("\r\n", "\n").replace('\r', "\n");

    let mut next = String::with_capacity(buffer.len() + normalized.len());
    next.push_str(buffer);
    next.push_str(&normalized);

    if next.len() > capacity {
        let mut cut = next.len() - capacity;
        while !next.is_char_boundary(cut) {
            cut += 1;
        }
        next.drain(..cut);
    }
    next
}

/// First pattern (in order) matching anywhere in `buffer`
pub fn first_match<'p>(buffer: &str, patterns: &'p [CompiledPattern]) -> Option<&'p CompiledPattern> {
    patterns.iter().find(|p| p.regex.is_match(buffer))
}

/// A newly detected state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// Name of the matched pattern
    pub state: String,
    /// State recorded before this one
    pub previous: Option<String>,
    pub description: Option<String>,
    /// The last few non-empty lines of the buffer at detection time
    pub excerpt: String,
}

impl Transition {
    /// Whether this state means the agent waits for input
    pub fn is_interaction(&self) -> bool {
        self.state.to_lowercase().contains(INTERACTION_MARKER)
    }
}

/// Per-task classifier
#[derive(Debug, Clone)]
pub struct OutputClassifier {
    patterns: Vec<CompiledPattern>,
    capacity: usize,
    buffer: String,
    state: Option<String>,
    answered: Option<String>,
}

impl OutputClassifier {
    pub fn new(patterns: Vec<CompiledPattern>, capacity: usize) -> Self {
        Self {
            patterns,
            capacity: capacity.max(1),
            buffer: String::new(),
            state: None,
            answered: None,
        }
    }

    /// Whether any patterns are configured
    pub fn is_enabled(&self) -> bool {
        !self.patterns.is_empty()
    }

    /// Feed one chunk of clean output.
    ///
    /// Returns a transition only when the first matching pattern differs
    /// from the currently recorded state.
    pub fn push(&mut self, chunk: &str) -> Option<Transition> {
        if !self.is_enabled() {
            return None;
        }

        self.buffer = append(&self.buffer, chunk, self.capacity);
        if let Some(end) = self.rearm_offset() {
            self.buffer.drain(..end);
            self.answered = None;
            self.state = None;
        }

        let matched = first_match(&self.buffer, &self.patterns)?;
        if self.state.as_deref() == Some(matched.name.as_str()) {
            return None;
        }

        self.answered = None;
        let transition = Transition {
            state: matched.name.clone(),
            previous: self.state.replace(matched.name.clone()),
            description: matched.description.clone(),
            excerpt: self.tail(5),
        };
        Some(transition)
    }

    /// Record that the current prompt was answered.
    ///
    /// Buffered output is dropped. An interaction state stays recorded so a
    /// redraw of the same prompt is not reported again.
    pub fn acknowledge(&mut self) {
        self.buffer.clear();
        self.answered = self
            .state
            .take()
            .filter(|state| state.to_lowercase().contains(INTERACTION_MARKER));
        self.state = self.answered.clone();
    }

    /// Interaction state answered last, until detection re-arms
    pub fn answered(&self) -> Option<&str> {
        self.answered.as_deref()
    }

    /// End offset of the first completed line proving the answered prompt
    /// is gone
    fn rearm_offset(&self) -> Option<usize> {
        let answered = self.answered.as_deref()?;
        let Some(pattern) = self.patterns.iter().find(|p| p.name == answered) else {
            return Some(0);
        };

        let mut offset = 0;
        for line in self.buffer.split_inclusive('\n') {
            if !line.ends_with('\n') {
                break;
            }
            offset += line.len();
            if !line.trim().is_empty() && !pattern.regex.is_match(line) {
                return Some(offset);
            }
        }
        None
    }

    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    /// Last `lines` non-empty lines of the buffer
    pub fn tail(&self, lines: usize) -> String {
        let mut recent: Vec<&str> = self
            .buffer
            .lines()
            .rev()
            .filter(|l| !l.trim().is_empty())
            .take(lines)
            .collect();
        recent.reverse();
        recent.join("\n")
    }
}
