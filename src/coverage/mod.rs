//! Adapter over an external line-coverage tracer.
//!
//! The tracer is a black box that attributes executed lines to a named
//! context. Many tracers attribute each line only to the *first* context
//! that executes it within a session, so sharing a session across tests
//! silently drops dependencies for every later test calling the same
//! code. The adapter therefore harvests and resets after every single
//! test: one context, one session.

use std::collections::BTreeSet;

use ahash::AHashMap;

use crate::errors::{EzmonError, Result};

/// Executed lines of one file.
pub type LineSet = BTreeSet<u32>;
/// Executed lines per file path.
pub type FileLines = AHashMap<String, LineSet>;
/// Harvested data: context id → file → lines.
pub type ContextCoverage = AHashMap<String, FileLines>;

/// Contract of the external line tracer.
pub trait LineTracer {
    /// Start tracing.
    fn start(&mut self) -> Result<()>;
    /// Attribute subsequently executed lines to `context`.
    fn switch_context(&mut self, context: &str) -> Result<()>;
    /// Data observed since the last `reset`.
    fn harvest(&mut self) -> Result<ContextCoverage>;
    /// Clear tracer state.
    fn reset(&mut self) -> Result<()>;
    /// Stop tracing.
    fn stop(&mut self) -> Result<()>;
}

/// Per-test session policy on top of a [`LineTracer`].
pub struct CoverageAdapter<T: LineTracer> {
    tracer: T,
    session_open: bool,
    active: Option<String>,
}

impl<T: LineTracer> CoverageAdapter<T> {
    pub fn new(tracer: T) -> CoverageAdapter<T> {
        CoverageAdapter {
            tracer,
            session_open: false,
            active: None,
        }
    }

    pub fn begin_session(&mut self) -> Result<()> {
        if self.session_open {
            return Err(EzmonError::SessionState("coverage session already open".into()));
        }
        self.tracer.start()?;
        self.tracer.reset()?;
        self.session_open = true;
        Ok(())
    }

    /// Begin attributing lines to `test_id`. Must be called at the start
    /// of each test regardless of the test's internal concurrency.
    pub fn begin_test(&mut self, test_id: &str) -> Result<()> {
        if !self.session_open {
            return Err(EzmonError::SessionState("coverage session not open".into()));
        }
        if let Some(active) = &self.active {
            return Err(EzmonError::SessionState(format!(
                "test `{active}` still collecting"
            )));
        }
        self.tracer.switch_context(test_id)?;
        self.active = Some(test_id.to_string());
        Ok(())
    }

    /// Harvest the active test's lines and reset the tracer, so the next
    /// test starts from a blank attribution state.
    pub fn end_test(&mut self) -> Result<(String, FileLines)> {
        let test_id = self
            .active
            .take()
            .ok_or_else(|| EzmonError::SessionState("no test active".into()))?;
        let mut harvested = self.tracer.harvest()?;
        self.tracer.reset()?;
        let lines = harvested.remove(&test_id).unwrap_or_default();
        Ok((test_id, lines))
    }

    pub fn end_session(&mut self) -> Result<()> {
        if !self.session_open {
            return Ok(());
        }
        self.session_open = false;
        self.active = None;
        self.tracer.stop()
    }
}

#[cfg(test)]
mod tests {
    use ahash::AHashMap;

    use super::{ContextCoverage, CoverageAdapter, FileLines, LineSet, LineTracer};
    use crate::errors::Result;

    /// A tracer with the problematic real-world behavior: within one
    /// tracer session a line sticks to the first context that ran it.
    struct FirstWinsTracer {
        /// (file, line) executions scripted per context, consumed in order.
        script: Vec<(String, Vec<(String, u32)>)>,
        seen: AHashMap<(String, u32), String>,
        data: ContextCoverage,
    }

    impl FirstWinsTracer {
        fn new(script: Vec<(&str, Vec<(&str, u32)>)>) -> Self {
            FirstWinsTracer {
                script: script
                    .into_iter()
                    .map(|(ctx, hits)| {
                        (
                            ctx.to_string(),
                            hits.into_iter().map(|(f, l)| (f.to_string(), l)).collect(),
                        )
                    })
                    .collect(),
                seen: AHashMap::new(),
                data: ContextCoverage::new(),
            }
        }
    }

    impl LineTracer for FirstWinsTracer {
        fn start(&mut self) -> Result<()> {
            Ok(())
        }

        fn switch_context(&mut self, context: &str) -> Result<()> {
            // "execute" the scripted lines for this context
            if let Some(pos) = self.script.iter().position(|(ctx, _)| ctx == context) {
                let (ctx, hits) = self.script.remove(pos);
                for (file, line) in hits {
                    let owner = self
                        .seen
                        .entry((file.clone(), line))
                        .or_insert_with(|| ctx.clone());
                    self.data
                        .entry(owner.clone())
                        .or_insert_with(FileLines::new)
                        .entry(file)
                        .or_insert_with(LineSet::new)
                        .insert(line);
                }
            }
            Ok(())
        }

        fn harvest(&mut self) -> Result<ContextCoverage> {
            Ok(self.data.clone())
        }

        fn reset(&mut self) -> Result<()> {
            self.seen.clear();
            self.data.clear();
            Ok(())
        }

        fn stop(&mut self) -> Result<()> {
            Ok(())
        }
    }

    /// Two tests hitting the same line both observe it, because the
    /// adapter resets between tests.
    #[test]
    fn test_batch_of_one_keeps_shared_lines() {
        let tracer = FirstWinsTracer::new(vec![
            ("test_add_pos", vec![("math.rs", 2)]),
            ("test_add_neg", vec![("math.rs", 2)]),
        ]);
        let mut adapter = CoverageAdapter::new(tracer);
        adapter.begin_session().unwrap();

        adapter.begin_test("test_add_pos").unwrap();
        let (_, first) = adapter.end_test().unwrap();
        adapter.begin_test("test_add_neg").unwrap();
        let (_, second) = adapter.end_test().unwrap();
        adapter.end_session().unwrap();

        assert!(first["math.rs"].contains(&2));
        // without the per-test reset this map would be empty
        assert!(second["math.rs"].contains(&2));
    }

    /// Overlapping tests are rejected instead of silently mixing lines.
    #[test]
    fn test_overlapping_tests_rejected() {
        let mut adapter = CoverageAdapter::new(FirstWinsTracer::new(vec![
            ("a", vec![]),
            ("b", vec![]),
        ]));
        adapter.begin_session().unwrap();
        adapter.begin_test("a").unwrap();
        assert!(adapter.begin_test("b").is_err());
    }

    /// Ending a test with no active context is an error.
    #[test]
    fn test_end_without_begin() {
        let mut adapter = CoverageAdapter::new(FirstWinsTracer::new(vec![]));
        adapter.begin_session().unwrap();
        assert!(adapter.end_test().is_err());
    }
}
