//! In-memory stand-ins for every collaborator of a session
//!
//! One [`FakeProcess`] holds the main image, the modules that can be loaded,
//! and counters for everything the engine does to it.

#![allow(dead_code, unsafe_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use hotfix::domain::{
    Address, Callable, FunctionRef, LoadedImage, LoaderError, ModuleHandle, PauseError,
    SymbolError, WriteError,
};
use hotfix::loader::ModuleLoader;
use hotfix::patching::{AbsoluteJump, Arch, CodeWriter};
use hotfix::pause::{PauseController, PauseToken};
use hotfix::symbolization::{ImageLoader, Receiver, SymbolSource, TypeDescriptor, TypeKind};
use hotfix::{Hotfixer, SessionLock};

pub const MAIN_BASE: u64 = 0x5555_0000_0000;
pub const MODULE_BASE: u64 = 0x7f00_0000_0000;

pub struct FakeModule {
    /// Path as requested by the caller
    pub requested: PathBuf,
    /// Path the loader reports in the image table
    pub canonical: PathBuf,
    pub registered: bool,
    pub exports: HashMap<String, u64>,
}

/// One code write as seen by the writer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Write {
    pub address: u64,
    pub bytes: Vec<u8>,
    pub paused: bool,
}

#[derive(Default)]
pub struct FakeProcess {
    pub functions: BTreeMap<String, FunctionRef>,
    pub types: HashMap<String, TypeDescriptor>,
    pub modules: Vec<FakeModule>,

    pub image_loads: usize,
    pub module_loads: usize,
    pub pauses: usize,
    pub resumes: usize,
    pub paused: bool,
    pub writes: Vec<Write>,
    pub fail_write_at: Option<u64>,
    /// Where a frozen thread sits on each successive pause
    pub stopped_at: VecDeque<u64>,
}

pub type Shared = Arc<Mutex<FakeProcess>>;

pub fn lock(process: &Shared) -> MutexGuard<'_, FakeProcess> {
    process.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl FakeProcess {
    pub fn function(&mut self, name: &str, offset: u64, size: u64) {
        let entry = MAIN_BASE + offset;
        self.functions.insert(name.to_string(), FunctionRef::new(name, entry, entry + size));
    }

    pub fn module(&mut self, requested: &str, canonical: &str, exports: &[(&str, u64)]) {
        self.modules.push(FakeModule {
            requested: PathBuf::from(requested),
            canonical: PathBuf::from(canonical),
            registered: true,
            exports: exports.iter().map(|(n, a)| ((*n).to_string(), *a)).collect(),
        });
    }

    pub fn entry(&self, name: &str) -> u64 {
        self.functions[name].entry.0
    }
}

/// A Go-flavoured service: `pkg.T.M` value methods, `pkg.(*T).M` pointer methods
pub fn service() -> Shared {
    let mut p = FakeProcess::default();
    p.function("pkg.Foo", 0x1000, 0x40);
    p.function("pkg.Foo.func1", 0x1040, 0x20);
    p.function("pkg.Bar", 0x1100, 0x40);
    p.function("pkg.Tiny", 0x1200, 10);
    p.function("pkg.Widget.String", 0x1400, 0x80);
    p.function("pkg.(*Widget).Get", 0x1500, 0x30);
    p.function("pkg.(*Widget).Set", 0x1600, 0x30);
    p.function("other.Helper", 0x2000, 0x40);

    p.types.insert("pkg.Widget".into(), TypeDescriptor::structure("pkg.Widget"));
    p.types.insert(
        "*pkg.Widget".into(),
        TypeDescriptor::pointer_to("*pkg.Widget", TypeDescriptor::structure("pkg.Widget")),
    );
    p.types.insert("pkg.Count".into(), TypeDescriptor::new("pkg.Count", TypeKind::Other("int".into())));

    p.module(
        "fix_v1.so",
        "/srv/patches/fix_v1.so",
        &[
            ("pkg.Foo", MODULE_BASE + 0x1000),
            ("pkg.Bar", MODULE_BASE + 0x1100),
            ("pkg.Tiny", MODULE_BASE + 0x1200),
            ("pkg.Widget.String", MODULE_BASE + 0x1400),
            ("pkg.(*Widget).Get", MODULE_BASE + 0x1500),
            ("pkg.(*Widget).Set", MODULE_BASE + 0x1600),
        ],
    );
    p.module("fix_v2.so", "/srv/patches/fix_v2.so", &[("pkg.Foo", MODULE_BASE + 0x9000)]);
    // Re-exports the main image's own pkg.Foo instead of redefining it
    p.module("noop.so", "/srv/patches/noop.so", &[("pkg.Foo", MAIN_BASE + 0x1000)]);
    p.module("partial.so", "/srv/patches/partial.so", &[("pkg.Foo", MODULE_BASE + 0x5000)]);
    Arc::new(Mutex::new(p))
}

pub struct FakeImages(pub Shared);

impl ImageLoader for FakeImages {
    fn load_main_image(&self) -> Result<Box<dyn SymbolSource>, SymbolError> {
        lock(&self.0).image_loads += 1;
        Ok(Box::new(FakeSource { process: Arc::clone(&self.0), merged: HashMap::new() }))
    }
}

pub struct FakeSource {
    process: Shared,
    merged: HashMap<String, Callable>,
}

impl SymbolSource for FakeSource {
    fn find_function(&self, name: &str) -> Result<FunctionRef, SymbolError> {
        lock(&self.process)
            .functions
            .get(name)
            .cloned()
            .ok_or_else(|| SymbolError::FunctionNotFound(name.to_string()))
    }

    fn find_type(&self, name: &str) -> Result<TypeDescriptor, SymbolError> {
        lock(&self.process)
            .types
            .get(name)
            .cloned()
            .ok_or_else(|| SymbolError::TypeNotFound(name.to_string()))
    }

    fn for_each_function(&self, visitor: &mut dyn FnMut(&str, Address) -> ControlFlow<()>) {
        let snapshot: Vec<(String, Address)> = lock(&self.process)
            .functions
            .values()
            .map(|f| (f.name.clone(), f.entry))
            .collect();
        for (name, entry) in snapshot {
            if visitor(&name, entry).is_break() {
                break;
            }
        }
    }

    fn method_prefix(&self, receiver: Receiver<'_>) -> String {
        match receiver {
            Receiver::Value(ty) => format!("{}.", ty.name),
            Receiver::Pointer(ty) => match ty.name.rsplit_once('.') {
                Some((pkg, name)) => format!("{pkg}.(*{name})."),
                None => format!("(*{}).", ty.name),
            },
        }
    }

    fn load_module_symbols(&mut self, module: &LoadedImage) -> Result<(), SymbolError> {
        let process = lock(&self.process);
        let found = process
            .modules
            .iter()
            .find(|m| m.canonical == module.path)
            .ok_or_else(|| SymbolError::NotMapped(module.path.clone()))?;
        for (name, entry) in &found.exports {
            self.merged.insert(name.clone(), Callable::direct(name.clone(), *entry));
        }
        Ok(())
    }

    fn resolve_callable(&self, name: &str, from_module: bool) -> Result<Callable, SymbolError> {
        if from_module {
            return self
                .merged
                .get(name)
                .cloned()
                .ok_or_else(|| SymbolError::FunctionNotFound(name.to_string()));
        }
        self.find_function(name).map(|f| Callable::direct(f.name, f.entry.0))
    }
}

pub struct FakeModules(pub Shared);

impl ModuleLoader for FakeModules {
    fn load(&self, path: &Path) -> Result<ModuleHandle, LoaderError> {
        let mut process = lock(&self.0);
        let index = process
            .modules
            .iter()
            .position(|m| m.requested == path)
            .ok_or(LoaderError::Open(libloading::Error::DlOpenUnknown))?;
        process.module_loads += 1;
        Ok(ModuleHandle(index))
    }

    fn loaded_images(&self) -> Result<Vec<LoadedImage>, LoaderError> {
        Ok(vec![LoadedImage { path: PathBuf::from("/srv/app/service"), base: Address(MAIN_BASE) }])
    }

    fn locate(&self, path: &Path) -> Result<Option<LoadedImage>, LoaderError> {
        let process = lock(&self.0);
        Ok(process.modules.iter().find(|m| m.requested == path && m.registered).map(|m| {
            LoadedImage { path: m.canonical.clone(), base: Address(MODULE_BASE) }
        }))
    }

    fn resolve_symbol_address(
        &self,
        _handle: ModuleHandle,
        name: &str,
    ) -> Result<Address, LoaderError> {
        Err(LoaderError::SymbolNotFound {
            name: name.to_string(),
            source: libloading::Error::DlSymUnknown,
        })
    }
}

pub struct FakePause(pub Shared);

impl PauseController for FakePause {
    fn pause(&self) -> Result<PauseToken, PauseError> {
        let mut process = lock(&self.0);
        if process.paused {
            return Err(PauseError::AlreadyPaused);
        }
        process.pauses += 1;
        process.paused = true;
        match process.stopped_at.pop_front() {
            Some(pc) => Ok(PauseToken::with_interrupted(3, vec![Address(pc)])),
            None => Ok(PauseToken::new(3)),
        }
    }

    fn resume(&self, _token: PauseToken) {
        let mut process = lock(&self.0);
        process.resumes += 1;
        process.paused = false;
    }
}

pub struct FakeWriter(pub Shared);

impl CodeWriter for FakeWriter {
    unsafe fn write_code(&self, address: Address, bytes: &[u8]) -> Result<(), WriteError> {
        let mut process = lock(&self.0);
        if process.fail_write_at == Some(address.0) {
            return Err(WriteError::InvalidRange { address: address.0, len: bytes.len() });
        }
        let paused = process.paused;
        process.writes.push(Write { address: address.0, bytes: bytes.to_vec(), paused });
        Ok(())
    }
}

pub struct Harness {
    pub process: Shared,
    pub hotfixer: Hotfixer,
}

impl Harness {
    pub fn state(&self) -> MutexGuard<'_, FakeProcess> {
        lock(&self.process)
    }
}

/// Engine over [`service`] with a private session lock
pub fn harness() -> Harness {
    harness_with(service(), Arc::new(SessionLock::new()))
}

pub fn harness_with(process: Shared, session_lock: Arc<SessionLock>) -> Harness {
    let hotfixer = Hotfixer::builder()
        .image_loader(FakeImages(Arc::clone(&process)))
        .module_loader(FakeModules(Arc::clone(&process)))
        .pause_controller(FakePause(Arc::clone(&process)))
        .code_writer(FakeWriter(Arc::clone(&process)))
        .redirect_encoder(AbsoluteJump::for_arch(Arch::X86_64))
        .session_lock(session_lock)
        .build();
    Harness { process, hotfixer }
}
