use fail::FailScenario;

/// Configures fail points for the lifetime of the guard.
///
/// [`FailScenario`] holds a process-wide lock, so tests that use this guard run one at a time.
/// Every configured fail point is switched off again on drop.
pub struct FailPointGuard<'a> {
    _scenario: FailScenario<'a>,
    names: Vec<String>,
}

impl<'a> FailPointGuard<'a> {
    pub fn configure(actions: &[(&str, &str)]) -> FailPointGuard<'a> {
        let scenario = FailScenario::setup();

        let mut names = Vec::with_capacity(actions.len());
        for (name, action) in actions {
            fail::cfg(*name, action).unwrap();
            names.push(name.to_string());
        }

        Self {
            _scenario: scenario,
            names,
        }
    }

    /// Turns a single fail point off before the guard is dropped.
    pub fn disable(&self, name: &str) {
        fail::remove(name);
    }
}

impl Drop for FailPointGuard<'_> {
    fn drop(&mut self) {
        for name in &self.names {
            fail::remove(name);
        }
    }
}
