//! Session orchestration
//!
//! A session walks a fixed sequence of stages and stops at the first error:
//!
//! ```text
//! Idle ─▶ LockAcquired ─▶ ImageLoaded ─▶ TargetsResolved ─▶ ModuleLoaded
//!      ─▶ Validated ─▶ (Paused) ─▶ Patched ─▶ Done
//!                  any stage ─▶ Failed
//! ```
//!
//! Whatever happens, including a panic inside any stage, the caller gets a
//! [`SessionResult`] and the single-flight lock is released. A failure while
//! applying leaves already written redirects in place: there is no rollback.

pub mod lock;
pub mod log;
pub mod panic_trap;
pub mod result;

pub use self::lock::{SessionGuard, SessionLock};
pub use self::log::SessionLog;
pub use self::result::{SessionResult, SessionStage};

use ::log::{info, warn};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use crate::domain::{ArchMode, HotfixError, PatchSet};
use crate::loader::{DlopenLoader, ModuleLoader};
use crate::patching::{
    AbsoluteJump, CodeWriter, PatchApplier, PatchContext, ProcessMemory, RedirectApplier,
    RedirectEncoder,
};
use crate::pause::{PauseController, PauseCoordinator, SignalPause};
use crate::planning::PatchPlanner;
use crate::selection::Selector;
use crate::session_log;
use crate::symbolization::{CurrentExe, ImageLoader};

use self::panic_trap::trap;

/// The patch engine with its collaborators wired in
pub struct Hotfixer {
    images: Box<dyn ImageLoader>,
    modules: Box<dyn ModuleLoader>,
    pause: Box<dyn PauseController>,
    writer: Box<dyn CodeWriter>,
    encoder: Box<dyn RedirectEncoder>,
    lock: Arc<SessionLock>,
}

/// Substitutes collaborators; anything not set uses the native one
#[derive(Default)]
pub struct HotfixerBuilder {
    images: Option<Box<dyn ImageLoader>>,
    modules: Option<Box<dyn ModuleLoader>>,
    pause: Option<Box<dyn PauseController>>,
    writer: Option<Box<dyn CodeWriter>>,
    encoder: Option<Box<dyn RedirectEncoder>>,
    lock: Option<Arc<SessionLock>>,
}

impl HotfixerBuilder {
    #[must_use]
    pub fn image_loader(mut self, images: impl ImageLoader + 'static) -> Self {
        self.images = Some(Box::new(images));
        self
    }

    #[must_use]
    pub fn module_loader(mut self, modules: impl ModuleLoader + 'static) -> Self {
        self.modules = Some(Box::new(modules));
        self
    }

    #[must_use]
    pub fn pause_controller(mut self, pause: impl PauseController + 'static) -> Self {
        self.pause = Some(Box::new(pause));
        self
    }

    #[must_use]
    pub fn code_writer(mut self, writer: impl CodeWriter + 'static) -> Self {
        self.writer = Some(Box::new(writer));
        self
    }

    #[must_use]
    pub fn redirect_encoder(mut self, encoder: impl RedirectEncoder + 'static) -> Self {
        self.encoder = Some(Box::new(encoder));
        self
    }

    /// Lock shared with other engines; defaults to [`SessionLock::global`]
    #[must_use]
    pub fn session_lock(mut self, lock: Arc<SessionLock>) -> Self {
        self.lock = Some(lock);
        self
    }

    #[must_use]
    pub fn build(self) -> Hotfixer {
        Hotfixer {
            images: self.images.unwrap_or_else(|| Box::new(CurrentExe)),
            modules: self.modules.unwrap_or_else(|| Box::new(DlopenLoader)),
            pause: self.pause.unwrap_or_else(|| Box::new(SignalPause::default())),
            writer: self.writer.unwrap_or_else(|| Box::new(ProcessMemory)),
            encoder: self.encoder.unwrap_or_else(|| Box::new(AbsoluteJump::native())),
            lock: self.lock.unwrap_or_else(SessionLock::global),
        }
    }
}

/// Mutable state of one session, turned into the result at the end
struct SessionRun {
    module_path: PathBuf,
    methods: Vec<String>,
    stage: SessionStage,
    log: SessionLog,
}

impl Hotfixer {
    /// Real debug info, `dlopen`, signal pause and `mprotect` writes
    #[must_use]
    pub fn native() -> Self {
        Self::builder().build()
    }

    #[must_use]
    pub fn builder() -> HotfixerBuilder {
        HotfixerBuilder::default()
    }

    /// Whether a session sharing this engine's lock is running
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.lock.is_held()
    }

    /// Patch with the default redirect applier
    pub fn patch(
        &self,
        module_path: impl AsRef<Path>,
        selector: &Selector,
        thread_safe: bool,
    ) -> SessionResult {
        self.patch_with(module_path, selector, &RedirectApplier, thread_safe)
    }

    /// Patch with a caller-supplied applier
    ///
    /// Never panics and never returns early: every outcome, including a
    /// panic inside a stage or the applier, is reported in the result.
    pub fn patch_with(
        &self,
        module_path: impl AsRef<Path>,
        selector: &Selector,
        applier: &dyn PatchApplier,
        thread_safe: bool,
    ) -> SessionResult {
        let start = Instant::now();
        let mut run = SessionRun {
            module_path: module_path.as_ref().to_path_buf(),
            methods: Vec::new(),
            stage: SessionStage::Idle,
            log: SessionLog::new(),
        };

        let outcome = trap(|| self.run(&mut run, selector, applier, thread_safe));
        let err = match outcome {
            Ok(Ok(())) => {
                run.stage = SessionStage::Done;
                None
            }
            Ok(Err(err)) => Some(err),
            Err(trapped) => {
                // A panic inside the pause window leaves forwarding held
                run.log.release();
                session_log!(run.log, "session aborted: {}\n{}", trapped.message, trapped.backtrace);
                Some(HotfixError::Panicked { message: trapped.message, backtrace: trapped.backtrace })
            }
        };

        let cost = start.elapsed();
        match &err {
            None => info!("Hotfix session patched {} functions in {cost:?}", run.methods.len()),
            Some(err) => warn!("Hotfix session failed after {}: {err}", run.stage),
        }

        SessionResult {
            module_path: run.module_path,
            thread_safe,
            methods: run.methods,
            cost,
            last_stage: if err.is_some() { SessionStage::Failed } else { SessionStage::Done },
            reached: run.stage,
            err,
            message: run.log.into_message(),
        }
    }

    fn run(
        &self,
        run: &mut SessionRun,
        selector: &Selector,
        applier: &dyn PatchApplier,
        thread_safe: bool,
    ) -> Result<(), HotfixError> {
        let Some(_guard) = self.lock.try_acquire() else {
            session_log!(run.log, "another hotfix session is in progress");
            return Err(HotfixError::SessionBusy);
        };
        run.stage = SessionStage::LockAcquired;
        let log = &mut run.log;

        session_log!(
            log,
            "arch: {}/{}, cpu: {}, redirect size: {}",
            std::env::consts::OS,
            std::env::consts::ARCH,
            ArchMode::current(),
            self.encoder.len()
        );

        let t0 = Instant::now();
        session_log!(log, "loading main image ...");
        let mut source = self.images.load_main_image().map_err(HotfixError::ImageLoad)?;
        session_log!(log, "load main image finished, cost: {:?}", t0.elapsed());
        run.stage = SessionStage::ImageLoaded;

        if let Ok(images) = self.modules.loaded_images() {
            for image in images {
                session_log!(log, "loaded image: {}@{}", image.path.display(), image.base);
            }
        }

        let t1 = Instant::now();
        session_log!(log, "lookup patch functions ...");
        let names = selector.select(source.as_ref())?;
        let set = PatchSet::new(names).ok_or(HotfixError::EmptyFunctions)?;
        let mut planner = PatchPlanner::new(source.as_mut(), self.modules.as_ref(), self.encoder.len());
        let entries = planner.resolve_entries(&set, log)?;
        session_log!(log, "lookup patch functions finished, cost: {:?}", t1.elapsed());
        run.stage = SessionStage::TargetsResolved;

        let t2 = Instant::now();
        session_log!(log, "opening module {} ...", run.module_path.display());
        let module = planner.open_module(&run.module_path, log)?;
        run.module_path.clone_from(&module.image.path);
        session_log!(log, "opening module finished, cost: {:?}", t2.elapsed());
        run.stage = SessionStage::ModuleLoaded;

        let t3 = Instant::now();
        session_log!(log, "validating hotfix functions ...");
        let targets = planner.cross_reference(&module, &entries, log)?;
        session_log!(log, "validating hotfix functions finished, cost: {:?}", t3.elapsed());
        run.methods = set.into_vec();
        run.stage = SessionStage::Validated;

        let t4 = Instant::now();
        session_log!(
            log,
            "apply patch ... module: {}, thread safe: {thread_safe}",
            run.module_path.display()
        );
        // An entry byte itself is safe to stop at; the rest of each redirect is not
        let redirect_len = self.encoder.len() as u64;
        let busy: Vec<Range<u64>> = targets
            .iter()
            .map(|target| target.old.entry.0 + 1..target.old.entry.0 + redirect_len)
            .collect();

        let stage = &mut run.stage;
        let methods = &run.methods;
        let applied = PauseCoordinator::new(self.pause.as_ref()).run(thread_safe, &busy, log, |log| {
            if !thread_safe {
                *stage = SessionStage::Paused;
            }
            let mut ctx = PatchContext {
                module_path: &module.image.path,
                thread_safe,
                methods,
                targets: &targets,
                encoder: self.encoder.as_ref(),
                writer: self.writer.as_ref(),
                log,
            };
            applier.apply(&mut ctx)
        })?;

        if let Err(failure) = applied {
            let cause = failure.cause.to_string();
            let err = failure.into_error(&targets);
            session_log!(log, "apply patch failed: {err}: {cause}, cost: {:?}", t4.elapsed());
            return Err(err);
        }
        session_log!(log, "apply patch success, cost: {:?}", t4.elapsed());
        run.stage = SessionStage::Patched;
        Ok(())
    }
}
