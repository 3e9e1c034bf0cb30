use anyhow::Context;
use cranelift_entity::PrimaryMap;
use tracing::{
    debug,
    info,
};

use crate::codegen::{
    machine::{
        function::{
            Function,
            FunctionId,
        },
        TargetMachine,
    },
    register_allocator::{
        RegAlloc,
        RegAllocConfig,
        RegAllocError,
        RegAllocStats,
        Verifier,
    },
};

#[derive(Debug, Clone)]
pub struct Module<TM: TargetMachine> {
    pub(crate) functions: PrimaryMap<FunctionId, Function<TM>>,
}

impl<TM: TargetMachine> Default for Module<TM> {
    fn default() -> Self {
        Self {
            functions: PrimaryMap::new(),
        }
    }
}

impl<TM: TargetMachine> Module<TM> {
    pub fn add_function(&mut self, function: Function<TM>) -> FunctionId {
        self.functions.push(function)
    }

    pub fn functions(&self) -> impl ExactSizeIterator<Item = (FunctionId, &Function<TM>)> {
        self.functions.iter()
    }

    pub fn function(&self, id: FunctionId) -> &Function<TM> {
        &self.functions[id]
    }

    /// Allocates registers for every function of the module, stopping at the first one that fails.
    pub fn run_register_allocator(
        &mut self,
        config: RegAllocConfig,
    ) -> anyhow::Result<Vec<(FunctionId, RegAllocStats)>> {
        info!("Running register allocator");
        let mut stats = Vec::with_capacity(self.functions.len());
        for (function_id, function) in &mut self.functions {
            if !function.has_cfg() {
                function.build_cfg();
            }
            debug!("Running register allocator for function {function_id}");
            let function_stats = RegAlloc::new(function, config)
                .run()
                .with_context(|| format!("Failed to allocate registers for {}", function.name))?;
            if config.verify {
                let errors = Verifier::new(function).verify();
                if !errors.is_empty() {
                    return Err(RegAllocError::Verification {
                        function: function.name.clone(),
                        errors,
                    })
                    .with_context(|| format!("Failed to verify {}", function.name));
                }
            }
            debug!("Register allocator finished for function {function_id}");
            stats.push((function_id, function_stats));
        }
        Ok(stats)
    }
}

impl<TM: TargetMachine> std::fmt::Display for Module<TM> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (_, function) in self.functions() {
            writeln!(f, "{function}")?;
        }
        Ok(())
    }
}
