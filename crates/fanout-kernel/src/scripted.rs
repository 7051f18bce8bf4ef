//! Deterministic source clients for demos and tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use fanout_protocol::{FragmentStream, SourceClient, SourceError, SourceRequest};

use crate::registry::SourceRegistry;

/// A source that replays a fixed list of fragments.
///
/// Every fragment is preceded by `delay`; `stall` is slept once before the
/// first fragment, which is how a hung upstream is modelled. Sleeps block
/// the calling worker thread, as a real synchronous client would.
#[derive(Debug, Clone)]
pub struct ScriptedSource {
    fragments: Vec<String>,
    delay: Duration,
    stall: Duration,
    fail_on_invoke: Option<String>,
    fail_after: Option<(usize, String)>,
    invocations: Arc<AtomicU32>,
}

impl ScriptedSource {
    pub fn new<I, S>(fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fragments: fragments.into_iter().map(Into::into).collect(),
            delay: Duration::ZERO,
            stall: Duration::ZERO,
            fail_on_invoke: None,
            fail_after: None,
            invocations: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Splits `text` on whitespace, keeping a trailing space on each word.
    pub fn words(text: &str) -> Self {
        Self::new(text.split_whitespace().map(|word| format!("{word} ")))
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn stall(mut self, stall: Duration) -> Self {
        self.stall = stall;
        self
    }

    /// `invoke` itself fails with an upstream error.
    pub fn fail_on_invoke(mut self, message: impl Into<String>) -> Self {
        self.fail_on_invoke = Some(message.into());
        self
    }

    /// The stream yields `count` fragments and then an upstream error.
    pub fn fail_after(mut self, count: usize, message: impl Into<String>) -> Self {
        self.fail_after = Some((count, message.into()));
        self
    }

    /// Number of times `invoke` has been called, across clones.
    pub fn invocations(&self) -> u32 {
        self.invocations.load(Ordering::SeqCst)
    }
}

impl SourceClient for ScriptedSource {
    fn invoke(&self, _request: &SourceRequest) -> Result<FragmentStream, SourceError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = &self.fail_on_invoke {
            return Err(SourceError::Upstream(message.clone()));
        }
        Ok(Box::new(ScriptedStream {
            pending: self.fragments.clone().into_iter(),
            emitted: 0,
            delay: self.delay,
            stall: Some(self.stall).filter(|stall| !stall.is_zero()),
            fail_after: self.fail_after.clone(),
            failed: false,
        }))
    }
}

/// Scripted sources covering the common shapes: a quick answer, a slow
/// one, a source that breaks mid-answer, and one that never connects.
pub fn demo_registry() -> SourceRegistry {
    let mut registry = SourceRegistry::default();
    registry.register(
        "swift",
        "short answer, 20ms per word",
        Arc::new(
            ScriptedSource::words("Fan-out starts every source at once and merges what comes back.")
                .delay(Duration::from_millis(20)),
        ),
    );
    registry.register(
        "deliberate",
        "long answer, 150ms per word",
        Arc::new(
            ScriptedSource::words(
                "Each source streams on its own worker so a slow upstream never holds back \
                 the others, and every fragment is tagged with where it came from.",
            )
            .delay(Duration::from_millis(150)),
        ),
    );
    registry.register(
        "flaky",
        "drops the connection after three words",
        Arc::new(
            ScriptedSource::words("This answer will not finish properly.")
                .delay(Duration::from_millis(40))
                .fail_after(3, "connection reset by peer"),
        ),
    );
    registry.register(
        "offline",
        "fails before producing anything",
        Arc::new(ScriptedSource::new(["unused"]).fail_on_invoke("503 service unavailable")),
    );
    registry
}

struct ScriptedStream {
    pending: std::vec::IntoIter<String>,
    emitted: usize,
    delay: Duration,
    stall: Option<Duration>,
    fail_after: Option<(usize, String)>,
    failed: bool,
}

impl Iterator for ScriptedStream {
    type Item = Result<String, SourceError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if let Some(stall) = self.stall.take() {
            std::thread::sleep(stall);
        }
        if let Some((count, _)) = &self.fail_after
            && self.emitted >= *count
        {
            self.failed = true;
            return self
                .fail_after
                .take()
                .map(|(_, message)| Err(SourceError::Upstream(message)));
        }
        let fragment = self.pending.next()?;
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        self.emitted += 1;
        Some(Ok(fragment))
    }
}
