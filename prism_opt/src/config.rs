//! Optimizer configuration.
//!
//! Every option is an aggressiveness knob. None of them changes the
//! correctness contract: observable results are the same with any setting.

/// Configuration for one optimizing compile.
#[derive(Debug, Clone)]
pub struct OptConfig {
    /// Install deoptimizing guards. When false every rewrite uses an explicit
    /// slow path instead and the output contains no deoptimization points.
    pub speculative: bool,

    /// Maximum number of receiver classes handled by a type-specialized
    /// rewrite before falling back to dispatch.
    pub max_polymorphic_checks: usize,

    /// Guess the class of an operand that feedback never observed from its
    /// sibling operand.
    pub guess_untested_types: bool,

    /// Fuse `(a << b) & c` into a single truncating shift.
    pub fuse_shift_mask: bool,

    /// Emit a trace event for every rewrite decision.
    pub trace_decisions: bool,

    /// Share of feedback hits above which a multi-target dispatch gets an
    /// inline fast-path check for the dominant class.
    pub dominant_type_ratio: f64,

    /// Collapse branches whose arms rejoin through empty blocks.
    pub eliminate_redundant_branches: bool,

    /// Upper bound on range inference sweeps before remaining values are
    /// widened to the full range.
    pub max_range_iterations: usize,

    /// Replace eliminated bounds checks with non-throwing assertions.
    /// Used by soundness tests.
    pub assert_eliminated_bounds: bool,
}

impl Default for OptConfig {
    fn default() -> Self {
        Self {
            speculative: true,
            max_polymorphic_checks: 4,
            guess_untested_types: true,
            fuse_shift_mask: true,
            trace_decisions: false,
            dominant_type_ratio: 0.9,
            eliminate_redundant_branches: true,
            max_range_iterations: 64,
            assert_eliminated_bounds: false,
        }
    }
}

impl OptConfig {
    /// JIT-style configuration: guards deoptimize.
    pub fn speculative() -> Self {
        Self::default()
    }

    /// Ahead-of-time style configuration: no deoptimization points.
    pub fn conservative() -> Self {
        Self {
            speculative: false,
            guess_untested_types: false,
            ..Self::default()
        }
    }

    /// Configuration for tests: decision tracing on.
    pub fn for_testing() -> Self {
        Self {
            trace_decisions: true,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets() {
        assert!(OptConfig::speculative().speculative);
        assert!(!OptConfig::conservative().speculative);
        assert!(!OptConfig::conservative().guess_untested_types);
        assert!(OptConfig::for_testing().trace_decisions);
        assert_eq!(OptConfig::default().max_polymorphic_checks, 4);
    }
}
