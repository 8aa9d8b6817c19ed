//! Sandbox runtime.
//!
//! [`SandboxRuntime`] wraps the wasmtime [`Engine`] and the WASI preview1
//! process environment. The bridge uses it for four things only: load a
//! module, instantiate it with an [`ImportTable`], call an export by name,
//! and look up a named memory export.

use std::path::Path;

use wasmtime::{
    Caller, Engine, ExternType, Instance, Linker, Memory, Module, Store, StoreLimits,
    StoreLimitsBuilder, Trap, Val, ValType,
};
use wasmtime_wasi::preview1::{self, WasiP1Ctx};
use wasmtime_wasi::{DirPerms, FilePerms, I32Exit, WasiCtxBuilder};

use crate::config::SandboxConfig;
use crate::error::{BridgeError, Result};
use crate::region::{MemoryRegion, Owner};

/// Module name of the host-implemented imports.
pub const HOST_IMPORT_MODULE: &str = "env";
/// Host import returning the input region offset.
pub const IMPORT_GET_INPUT_BUF: &str = "get_input_buf";
/// Host import returning the output region offset.
pub const IMPORT_GET_OUTPUT_BUF: &str = "get_output_buf";

/// Size of one wasm page.
pub const WASM_PAGE_SIZE: u64 = 64 * 1024;

/// Offsets the host reserved inside guest memory, served to the guest by
/// the buffer-offset imports.
#[derive(Debug, Clone, Copy, Default)]
struct HostOffsets {
    input: Option<u32>,
    output: Option<u32>,
}

/// Per-instance state stored in the wasmtime [`Store`].
struct HostState {
    wasi: WasiP1Ctx,
    limits: StoreLimits,
    offsets: HostOffsets,
}

/// Host functions to register before instantiation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportTable {
    buffer_offsets: bool,
}

impl ImportTable {
    /// WASI only.
    pub fn none() -> Self {
        Self::default()
    }

    /// WASI plus `env.get_input_buf` / `env.get_output_buf`, which return
    /// the offsets set with [`GuestInstance::set_host_offsets`], or `-1`
    /// before they are set.
    pub fn buffer_offsets() -> Self {
        Self {
            buffer_offsets: true,
        }
    }

    pub fn has_buffer_offsets(&self) -> bool {
        self.buffer_offsets
    }
}

/// A compiled guest module.
#[derive(Clone)]
pub struct GuestModule {
    name: String,
    module: Module,
}

impl GuestModule {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// One line per import and export, with function signatures.
    pub fn describe(&self) -> Vec<String> {
        let imports = self.module.imports().map(|import| {
            format!(
                "import {}::{} {}",
                import.module(),
                import.name(),
                describe_extern(&import.ty())
            )
        });
        let exports = self
            .module
            .exports()
            .map(|export| format!("export {} {}", export.name(), describe_extern(&export.ty())));
        imports.chain(exports).collect()
    }
}

fn val_type_name(ty: &ValType) -> &'static str {
    match ty {
        ValType::I32 => "i32",
        ValType::I64 => "i64",
        ValType::F32 => "f32",
        ValType::F64 => "f64",
        ValType::V128 => "v128",
        _ => "ref",
    }
}

fn describe_extern(ty: &ExternType) -> String {
    match ty {
        ExternType::Func(func) => {
            let params: Vec<_> = func.params().map(|p| val_type_name(&p)).collect();
            let results: Vec<_> = func.results().map(|r| val_type_name(&r)).collect();
            format!("func({}) -> ({})", params.join(", "), results.join(", "))
        }
        ExternType::Memory(_) => "memory".to_owned(),
        ExternType::Global(_) => "global".to_owned(),
        ExternType::Table(_) => "table".to_owned(),
        #[allow(unreachable_patterns)]
        _ => "other".to_owned(),
    }
}

/// A named memory export, bound to the instance it came from.
#[derive(Debug, Clone, Copy)]
pub struct GuestMemory(Memory);

/// One live guest instance.
///
/// An instance that traps is poisoned: every later call is refused with
/// [`BridgeError::InstancePoisoned`] without entering the guest.
pub struct GuestInstance {
    store: Store<HostState>,
    instance: Instance,
    module_name: String,
    poisoned: bool,
}

impl GuestInstance {
    pub fn module_name(&self) -> &str {
        &self.module_name
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Call an export taking and returning only `i32` values.
    ///
    /// Returns `None` for a `void` export. A guest `proc_exit(0)` counts as a
    /// normal return; any other exit status or trap is a
    /// [`BridgeError::GuestFault`] and poisons the instance.
    pub fn call(&mut self, export: &str, args: &[i32]) -> Result<Option<i32>> {
        if self.poisoned {
            return Err(BridgeError::InstancePoisoned);
        }
        let func = self
            .instance
            .get_func(&mut self.store, export)
            .ok_or_else(|| BridgeError::Link(format!("missing export `{export}`")))?;

        let ty = func.ty(&self.store);
        let params_ok = ty.params().len() == args.len()
            && ty.params().all(|p| matches!(p, ValType::I32));
        let results_ok =
            ty.results().len() <= 1 && ty.results().all(|r| matches!(r, ValType::I32));
        if !params_ok || !results_ok {
            return Err(BridgeError::Link(format!(
                "export `{export}` has signature {}, expected {} i32 parameter(s) and at most one i32 result",
                describe_extern(&ExternType::Func(ty.clone())),
                args.len()
            )));
        }

        let params: Vec<Val> = args.iter().map(|a| Val::I32(*a)).collect();
        let mut results = vec![Val::I32(0); ty.results().len()];

        if let Err(err) = func.call(&mut self.store, &params, &mut results) {
            match err.downcast_ref::<I32Exit>() {
                Some(exit) if exit.0 == 0 => {
                    tracing::debug!(export, "guest exited with status 0");
                    return Ok(None);
                }
                Some(exit) => {
                    self.poisoned = true;
                    return Err(BridgeError::GuestFault(format!(
                        "`{export}` exited with status {}",
                        exit.0
                    )));
                }
                None => {
                    self.poisoned = true;
                    let detail = match err.downcast_ref::<Trap>() {
                        Some(trap) => trap.to_string(),
                        None => format!("{err:#}"),
                    };
                    tracing::warn!(export, module = %self.module_name, error = %detail, "guest trapped");
                    return Err(BridgeError::GuestFault(format!("`{export}`: {detail}")));
                }
            }
        }

        if let Ok(remaining) = self.store.get_fuel() {
            tracing::trace!(export, fuel_remaining = remaining, "guest call returned");
        }

        Ok(match results.first() {
            Some(Val::I32(v)) => Some(*v),
            _ => None,
        })
    }

    /// Call an export that must return an `i32`.
    pub fn call_i32(&mut self, export: &str, args: &[i32]) -> Result<i32> {
        self.call(export, args)?
            .ok_or_else(|| BridgeError::Link(format!("export `{export}` returns no value")))
    }

    /// Look up a memory export.
    pub fn memory(&mut self, export: &str) -> Result<GuestMemory> {
        self.instance
            .get_memory(&mut self.store, export)
            .map(GuestMemory)
            .ok_or_else(|| BridgeError::Link(format!("missing memory export `{export}`")))
    }

    /// A region spanning the whole of `memory` at its current size.
    pub fn memory_region(&self, memory: GuestMemory) -> Result<MemoryRegion> {
        let len = self.data(memory).len();
        let capacity = u32::try_from(len)
            .map_err(|_| BridgeError::Config(format!("memory of {len} bytes exceeds 32-bit range")))?;
        MemoryRegion::new(0, capacity, Owner::Guest, len)
    }

    pub fn data(&self, memory: GuestMemory) -> &[u8] {
        memory.0.data(&self.store)
    }

    pub fn data_mut(&mut self, memory: GuestMemory) -> &mut [u8] {
        memory.0.data_mut(&mut self.store)
    }

    /// Grow `memory` by `bytes` rounded up to whole pages. Returns the byte
    /// offset where the new space begins.
    pub fn grow(&mut self, memory: GuestMemory, bytes: u64) -> Result<u64> {
        let pages = bytes.div_ceil(WASM_PAGE_SIZE);
        let current = self.data(memory).len() as u64;
        let previous_pages = memory.0.grow(&mut self.store, pages).map_err(|e| {
            tracing::warn!(pages, error = %e, "guest memory grow refused");
            BridgeError::out_of_bounds(current, pages * WASM_PAGE_SIZE, current)
        })?;
        Ok(previous_pages * WASM_PAGE_SIZE)
    }

    /// Offsets served by the buffer-offset imports.
    pub fn set_host_offsets(&mut self, input: u32, output: u32) {
        self.store.data_mut().offsets = HostOffsets {
            input: Some(input),
            output: Some(output),
        };
    }
}

/// The WebAssembly sandbox runtime.
///
/// Cheap to clone: clones share the same engine.
#[derive(Clone)]
pub struct SandboxRuntime {
    engine: Engine,
    config: SandboxConfig,
}

impl SandboxRuntime {
    /// Create a new sandbox runtime with the given configuration.
    pub fn new(config: SandboxConfig) -> Result<Self> {
        let mut wasm_config = wasmtime::Config::new();
        wasm_config.consume_fuel(true);
        wasm_config.wasm_memory64(false);

        let engine = Engine::new(&wasm_config)
            .map_err(|e| BridgeError::Load(format!("failed to create wasm engine: {e}")))?;

        tracing::info!(
            max_memory = config.max_memory,
            max_fuel = config.max_fuel,
            "sandbox runtime initialized"
        );

        Ok(Self { engine, config })
    }

    /// Create a runtime with default configuration.
    pub fn with_defaults() -> Result<Self> {
        Self::new(SandboxConfig::default())
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Load a module file. The module name is the file stem.
    pub fn load(&self, path: &Path) -> Result<GuestModule> {
        let bytes = std::fs::read(path)
            .map_err(|e| BridgeError::Load(format!("cannot read {}: {e}", path.display())))?;
        self.load_bytes(&module_name_for(path), &bytes)
    }

    /// Compile a module from bytes (binary or text format).
    pub fn load_bytes(&self, name: &str, bytes: &[u8]) -> Result<GuestModule> {
        let module = Module::new(&self.engine, bytes)
            .map_err(|e| BridgeError::Load(format!("module `{name}`: {e}")))?;
        tracing::info!(module = name, size_bytes = bytes.len(), "compiled wasm module");
        Ok(GuestModule {
            name: name.to_owned(),
            module,
        })
    }

    /// Instantiate `module` with a fresh store. `argv` becomes the guest's
    /// process argument list verbatim.
    pub fn instantiate(
        &self,
        module: &GuestModule,
        imports: ImportTable,
        argv: &[String],
    ) -> Result<GuestInstance> {
        let wasi = self.build_wasi(argv)?;
        let limits = StoreLimitsBuilder::new()
            .memory_size(self.config.max_memory)
            .build();

        let mut store = Store::new(
            &self.engine,
            HostState {
                wasi,
                limits,
                offsets: HostOffsets::default(),
            },
        );
        store.limiter(|state| &mut state.limits);
        store
            .set_fuel(self.config.max_fuel)
            .map_err(|e| BridgeError::Link(format!("failed to set fuel: {e}")))?;

        let mut linker: Linker<HostState> = Linker::new(&self.engine);
        preview1::add_to_linker_sync(&mut linker, |state: &mut HostState| &mut state.wasi)
            .map_err(|e| BridgeError::Link(format!("failed to define WASI: {e}")))?;
        if imports.has_buffer_offsets() {
            Self::define_offset_imports(&mut linker)?;
        }

        let instance = linker.instantiate(&mut store, &module.module).map_err(|e| {
            if e.downcast_ref::<Trap>().is_some() {
                BridgeError::GuestFault(format!("module `{}` trapped during start: {e}", module.name))
            } else {
                BridgeError::Link(format!("module `{}`: {e:#}", module.name))
            }
        })?;

        tracing::debug!(module = %module.name, args = argv.len(), "instantiated guest");

        Ok(GuestInstance {
            store,
            instance,
            module_name: module.name.clone(),
            poisoned: false,
        })
    }

    fn build_wasi(&self, argv: &[String]) -> Result<WasiP1Ctx> {
        let mut builder = WasiCtxBuilder::new();
        if self.config.inherit_stdio {
            builder.inherit_stdio();
        }
        if self.config.inherit_env {
            builder.inherit_env();
        }
        builder.args(argv);
        for dir in &self.config.preopens {
            builder
                .preopened_dir(
                    &dir.host_path,
                    &dir.guest_path,
                    DirPerms::all(),
                    FilePerms::all(),
                )
                .map_err(|e| {
                    BridgeError::Link(format!(
                        "cannot preopen {} as {}: {e}",
                        dir.host_path.display(),
                        dir.guest_path
                    ))
                })?;
        }
        Ok(builder.build_p1())
    }

    fn define_offset_imports(linker: &mut Linker<HostState>) -> Result<()> {
        fn as_guest_offset(offset: Option<u32>) -> i32 {
            offset.and_then(|o| i32::try_from(o).ok()).unwrap_or(-1)
        }

        linker
            .func_wrap(
                HOST_IMPORT_MODULE,
                IMPORT_GET_INPUT_BUF,
                |caller: Caller<'_, HostState>| -> i32 { as_guest_offset(caller.data().offsets.input) },
            )
            .map_err(|e| BridgeError::Link(e.to_string()))?;

        linker
            .func_wrap(
                HOST_IMPORT_MODULE,
                IMPORT_GET_OUTPUT_BUF,
                |caller: Caller<'_, HostState>| -> i32 {
                    as_guest_offset(caller.data().offsets.output)
                },
            )
            .map_err(|e| BridgeError::Link(e.to_string()))?;

        Ok(())
    }
}

fn module_name_for(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("module")
        .to_owned()
}
