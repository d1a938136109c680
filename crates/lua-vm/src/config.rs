/// Which standard library modules a [`crate::Vm`] installs into its globals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StdLib {
    pub base: bool,
    pub coroutine: bool,
    pub math: bool,
    pub string: bool,
    pub table: bool,
    pub os: bool,
    /// Install the host-touching part of `os` (`getenv`, `exit`, `remove`, `rename`).
    pub include_unsafe: bool,
}

impl StdLib {
    /// Every module, including the unsafe `os` functions.
    pub fn all() -> Self {
        Self {
            base: true,
            coroutine: true,
            math: true,
            string: true,
            table: true,
            os: true,
            include_unsafe: true,
        }
    }

    /// Every module, without host access.
    pub fn safe() -> Self {
        Self {
            include_unsafe: false,
            ..Self::all()
        }
    }

    /// An empty global environment.
    pub fn none() -> Self {
        Self {
            base: false,
            coroutine: false,
            math: false,
            string: false,
            table: false,
            os: false,
            include_unsafe: false,
        }
    }
}

impl Default for StdLib {
    fn default() -> Self {
        Self::all()
    }
}

/// Limits and library selection for one interpreter instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmConfig {
    /// Lua call frames per thread before "stack overflow".
    pub max_call_depth: usize,
    /// Nested host re-entries (metamethods, `pcall` of natives, `resume`, ...).
    pub max_host_depth: usize,
    /// Register slots per thread.
    pub max_stack_slots: usize,
    pub libs: StdLib,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            max_call_depth: 200_000,
            max_host_depth: 200,
            max_stack_slots: 1_000_000,
            libs: StdLib::default(),
        }
    }
}

impl VmConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_call_depth(mut self, depth: usize) -> Self {
        self.max_call_depth = depth;
        self
    }

    pub fn max_host_depth(mut self, depth: usize) -> Self {
        self.max_host_depth = depth;
        self
    }

    pub fn max_stack_slots(mut self, slots: usize) -> Self {
        self.max_stack_slots = slots;
        self
    }

    pub fn libs(mut self, libs: StdLib) -> Self {
        self.libs = libs;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_defaults() {
        let config = VmConfig::new().max_call_depth(50).libs(StdLib::safe());
        assert_eq!(config.max_call_depth, 50);
        assert_eq!(config.max_host_depth, 200);
        assert!(config.libs.os);
        assert!(!config.libs.include_unsafe);
    }
}
