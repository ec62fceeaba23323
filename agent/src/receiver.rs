//! Applies controller-sent updates to this node's local copy of the
//! configuration and aggregate state, verifying the post-application
//! hash before ever handing the result to the convergence callback.
//!
//! Reconciling desired configuration against observed local resources
//! is the convergence logic proper; it lives outside this crate. This
//! receiver's job ends at "the trees are now this, verified."

use orchd_diff::{apply, Patch};
use orchd_tree::{hash, Hash, Value};
use tracing::warn;

/// The pair of generation hashes every handler returns, to ride on
/// the command response.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Generations {
    pub current_configuration_generation: Hash,
    pub current_state_generation: Hash,
}

/// Notified with the newly-adopted configuration and state after a
/// handler successfully applies an update. Never invoked on a
/// rejected update.
pub trait ConvergenceCallback: Send + Sync {
    fn on_converge(&self, configuration: &Value, state: &Value);
}

impl<F> ConvergenceCallback for F
where
    F: Fn(&Value, &Value) + Send + Sync,
{
    fn on_converge(&self, configuration: &Value, state: &Value) {
        self(configuration, state)
    }
}

/// This node's adopted configuration and state, kept in lockstep with
/// their content hashes.
pub struct AgentReceiver {
    current_configuration: Value,
    current_configuration_hash: Hash,
    current_state: Value,
    current_state_hash: Hash,
}

impl AgentReceiver {
    /// Seeds the receiver with an initial configuration/state pair
    /// (typically both empty, before the first update ever arrives).
    pub fn new(configuration: Value, state: Value) -> Self {
        let current_configuration_hash = hash(&configuration);
        let current_state_hash = hash(&state);
        Self {
            current_configuration: configuration,
            current_configuration_hash,
            current_state: state,
            current_state_hash,
        }
    }

    /// The hashes a response to any handler below should carry.
    pub fn generations(&self) -> Generations {
        Generations {
            current_configuration_generation: self.current_configuration_hash,
            current_state_generation: self.current_state_hash,
        }
    }

    /// Handles `UPDATE_FULL`: adopts `configuration`/`state` if both
    /// hash to their claimed generation, else leaves current values
    /// untouched.
    pub fn handle_update_full(
        &mut self,
        configuration: Value,
        configuration_generation: Hash,
        state: Value,
        state_generation: Hash,
        callback: &dyn ConvergenceCallback,
    ) -> Generations {
        if hash(&configuration) != configuration_generation || hash(&state) != state_generation {
            warn!("UPDATE_FULL failed hash verification, ignoring");
            return self.generations();
        }
        self.current_configuration = configuration;
        self.current_configuration_hash = configuration_generation;
        self.current_state = state;
        self.current_state_hash = state_generation;
        callback.on_converge(&self.current_configuration, &self.current_state);
        self.generations()
    }

    /// Handles `UPDATE_DIFF`: applies both patches only if the
    /// controller's idea of our starting generations matches what we
    /// actually hold; otherwise returns our current generations
    /// unapplied so the controller notices the mismatch and falls
    /// back to `UPDATE_FULL`.
    pub fn handle_update_diff(
        &mut self,
        configuration_diff: Patch,
        start_configuration_generation: Hash,
        end_configuration_generation: Hash,
        state_diff: Patch,
        start_state_generation: Hash,
        end_state_generation: Hash,
        callback: &dyn ConvergenceCallback,
    ) -> Generations {
        if start_configuration_generation != self.current_configuration_hash
            || start_state_generation != self.current_state_hash
        {
            warn!("UPDATE_DIFF start generation mismatch, ignoring");
            return self.generations();
        }
        let new_configuration = match apply(&self.current_configuration, &configuration_diff) {
            Ok(value) => value,
            Err(error) => {
                warn!(%error, "UPDATE_DIFF configuration patch failed to apply, ignoring");
                return self.generations();
            }
        };
        let new_state = match apply(&self.current_state, &state_diff) {
            Ok(value) => value,
            Err(error) => {
                warn!(%error, "UPDATE_DIFF state patch failed to apply, ignoring");
                return self.generations();
            }
        };
        if hash(&new_configuration) != end_configuration_generation
            || hash(&new_state) != end_state_generation
        {
            warn!("UPDATE_DIFF failed hash verification after applying, ignoring");
            return self.generations();
        }
        self.current_configuration = new_configuration;
        self.current_configuration_hash = end_configuration_generation;
        self.current_state = new_state;
        self.current_state_hash = end_state_generation;
        callback.on_converge(&self.current_configuration, &self.current_state);
        self.generations()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchd_diff::diff;

    struct NoopCallback;
    impl ConvergenceCallback for NoopCallback {
        fn on_converge(&self, _configuration: &Value, _state: &Value) {}
    }

    #[test]
    fn update_full_adopts_on_matching_hashes() {
        let mut receiver = AgentReceiver::new(Value::leaf(0i64), Value::leaf(0i64));
        let next = Value::leaf(1i64);
        let generations = receiver.handle_update_full(
            next.clone(),
            hash(&next),
            Value::leaf(0i64),
            hash(&Value::leaf(0i64)),
            &NoopCallback,
        );
        assert_eq!(generations.current_configuration_generation, hash(&next));
    }

    #[test]
    fn update_full_rejects_on_hash_mismatch() {
        let mut receiver = AgentReceiver::new(Value::leaf(0i64), Value::leaf(0i64));
        let before = receiver.generations();
        let generations = receiver.handle_update_full(
            Value::leaf(1i64),
            hash(&Value::leaf(999i64)),
            Value::leaf(0i64),
            hash(&Value::leaf(0i64)),
            &NoopCallback,
        );
        assert_eq!(generations, before);
    }

    #[test]
    fn update_diff_applies_when_start_generation_matches() {
        let mut receiver = AgentReceiver::new(
            Value::record(vec![("a", Value::leaf(1i64))]),
            Value::leaf(0i64),
        );
        let before_cfg = Value::record(vec![("a", Value::leaf(1i64))]);
        let after_cfg = Value::record(vec![("a", Value::leaf(2i64))]);
        let patch = diff(&before_cfg, &after_cfg);
        let generations = receiver.handle_update_diff(
            patch,
            hash(&before_cfg),
            hash(&after_cfg),
            Patch::empty(),
            hash(&Value::leaf(0i64)),
            hash(&Value::leaf(0i64)),
            &NoopCallback,
        );
        assert_eq!(generations.current_configuration_generation, hash(&after_cfg));
    }

    #[test]
    fn update_diff_rejects_on_start_generation_mismatch() {
        let mut receiver = AgentReceiver::new(Value::leaf(0i64), Value::leaf(0i64));
        let before = receiver.generations();
        let generations = receiver.handle_update_diff(
            Patch::empty(),
            hash(&Value::leaf(999i64)),
            hash(&Value::leaf(0i64)),
            Patch::empty(),
            hash(&Value::leaf(0i64)),
            hash(&Value::leaf(0i64)),
            &NoopCallback,
        );
        assert_eq!(generations, before);
    }
}
