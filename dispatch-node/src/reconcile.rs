//! The `reconcile` command: move the backup disks of a VE to a new configuration.

use std::fmt;
use std::path::Path;
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, info, warn};

use dispatch_common::TimedOperation;
use dispatch_core::backup::disk::write;
use dispatch_core::backup::{
    BackupBackend, Batch, Dao, EditVm, Factory, Handler, MockBackupBackend, Service,
    SharedConfig, Unit, VeConfig,
};
use dispatch_core::{
    flags, CommandType, RequestPackage, ResultCode, Task, TaskBody, TaskFailure, TaskHandle,
    TaskHelper, TaskManager,
};

use crate::cli::ReconcileArgs;
use crate::config::{BackupBackendKind, Config};
use crate::session::LoggingSession;

/// Exclusive key of the reconciliation of one VE.
pub fn exclusive_key(vm_uuid: &str) -> String {
    format!("reconcile:{vm_uuid}")
}

fn uuid_of(config: &SharedConfig) -> String {
    config.read().unwrap_or_else(|e| e.into_inner()).uuid.clone()
}

/// Reconciles the backup disks of one VE, attaching through nested tasks.
///
/// The helper must carry the exclusive key of the VE.
pub struct ReconcileTask {
    current: SharedConfig,
    wanted: SharedConfig,
    backend: Arc<dyn BackupBackend>,
    manager: Arc<TaskManager>,
    edit: bool,
}

impl ReconcileTask {
    pub fn new(
        current: SharedConfig,
        wanted: SharedConfig,
        backend: Arc<dyn BackupBackend>,
        manager: Arc<TaskManager>,
    ) -> Self {
        Self {
            current,
            wanted,
            backend,
            manager,
            edit: false,
        }
    }

    /// Apply as a configuration edit of a possibly stopped VE.
    pub fn as_edit(mut self) -> Self {
        self.edit = true;
        self
    }
}

#[async_trait]
impl TaskBody for ReconcileTask {
    async fn prepare_task(&self, task: &Arc<TaskHelper>) -> ResultCode {
        let from = uuid_of(&self.current);
        let to = uuid_of(&self.wanted);
        if from != to {
            return TaskFailure::new(task).with_messages(ResultCode::InvalidArgument, from, to);
        }
        if !task.lock_to_execute() {
            return TaskFailure::new(task).with_message(ResultCode::ExclusiveTaskRunning, from);
        }
        ResultCode::Success
    }

    async fn run_body(&self, task: &Arc<TaskHelper>) -> ResultCode {
        if task.operation_is_cancelled() {
            return TaskFailure::new(task).code(ResultCode::OperationWasCanceled);
        }

        let mut service = Service::new(Arc::clone(&self.current), Arc::clone(&self.backend));
        service.set_context_task(task, Arc::clone(&self.manager));
        if self.edit {
            let agent = Unit::nested(task, Arc::clone(&self.manager), Arc::clone(&self.backend));
            let handler = Handler::with_agent(Arc::clone(&self.backend), agent);
            service.set_visitor(Box::new(EditVm::new(handler)));
        }

        let code = service.set_difference(&self.wanted).await;
        if code.is_failed() {
            return TaskFailure::new(task).code(code);
        }
        code
    }

    async fn finalize_task(&self, task: &Arc<TaskHelper>) {
        task.unlock_to_execute();
        task.send_default_response();
    }

    fn vm_uuid(&self) -> Option<String> {
        Some(uuid_of(&self.current))
    }
}

/// Events a reconciliation would dispatch, in order.
pub struct Plan {
    phases: Vec<(&'static str, Batch)>,
}

impl Plan {
    /// Plan the move from `current` to `wanted`. Fails if the move is not allowed.
    pub fn build(current: &SharedConfig, wanted: &SharedConfig) -> Result<Self> {
        let factory = {
            let config = current.read().unwrap_or_else(|e| e.into_inner());
            Factory::new(config.uuid.clone(), config.home_dir(), config.ve_type)
        };
        let diff = Dao::new(Arc::clone(current)).difference(&Dao::new(Arc::clone(wanted)), factory);

        let code = diff.validate();
        if code.is_failed() {
            anyhow::bail!("transition rejected: {code}");
        }

        let (mut novel, mut enabled, mut disabled, mut removed) =
            (Batch::new(), Batch::new(), Batch::new(), Batch::new());
        diff.get_novel(&mut novel);
        diff.get_updated(Some(&mut enabled), Some(&mut disabled));
        diff.get_removed(&mut removed);

        Ok(Self {
            phases: vec![
                ("disabled", disabled),
                ("removed", removed),
                ("novel", novel),
                ("enabled", enabled),
            ],
        })
    }

    pub fn len(&self) -> usize {
        self.phases.iter().map(|(_, batch)| batch.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return writeln!(f, "nothing to do");
        }
        for (phase, batch) in self.phases.iter().filter(|(_, batch)| !batch.is_empty()) {
            writeln!(f, "{phase}:")?;
            for event in batch.events() {
                writeln!(f, "  {event}")?;
            }
        }
        Ok(())
    }
}

/// Load a VE configuration from a YAML file.
pub fn load_ve_config(path: &Path) -> Result<SharedConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read VE config: {}", path.display()))?;
    let config: VeConfig = serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse VE config: {}", path.display()))?;
    Ok(Arc::new(RwLock::new(config)))
}

/// Write a VE configuration as YAML.
pub fn save_ve_config(config: &SharedConfig, path: &Path) -> Result<()> {
    let content = {
        let config = config.read().unwrap_or_else(|e| e.into_inner());
        serde_yaml::to_string(&*config).context("Failed to serialize VE config")?
    };
    std::fs::write(path, content)
        .with_context(|| format!("Failed to write VE config: {}", path.display()))?;
    Ok(())
}

/// Register the backup disks of `config` with the mock backend, as a previous
/// run would have left them.
fn seed(backend: &MockBackupBackend, config: &SharedConfig) -> Result<()> {
    let (uuid, home) = {
        let config = config.read().unwrap_or_else(|e| e.into_inner());
        (config.uuid.clone(), config.home_dir())
    };
    for disk in Dao::new(Arc::clone(config)).get_all() {
        let url = disk.read().unwrap_or_else(|e| e.into_inner()).storage_url.clone();
        let attached = backend
            .seed_attachment(&uuid, &home, &url)
            .with_context(|| format!("Failed to seed backup disk {url}"))?;
        write(&disk).system_name = attached.device_path;
    }
    Ok(())
}

/// Run the `reconcile` command. Returns the result code of the reconciliation.
pub async fn run(config: &Config, args: &ReconcileArgs) -> Result<ResultCode> {
    let current = load_ve_config(&args.from)?;
    let wanted = load_ve_config(&args.to)?;

    if args.plan {
        let plan = Plan::build(&current, &wanted)?;
        print!("{plan}");
        return Ok(ResultCode::Success);
    }

    let backend = match config.backup.backend {
        BackupBackendKind::Mock => Arc::new(MockBackupBackend::new()),
    };
    for (vm_uuid, state) in &config.backup.ve_states {
        backend.set_ve_state(vm_uuid, *state);
    }
    seed(&backend, &current)?;

    let manager = Arc::new(TaskManager::new());
    let session = Arc::new(LoggingSession::new(
        config.node.get_id(),
        config.node.vm_directory.clone(),
    ));
    let vm_uuid = uuid_of(&current);

    let request = RequestPackage::new(CommandType::VM_BACKUP_RECONCILE, vm_uuid.clone())
        .with_flags(flags::CANCEL_TASK_ON_END_SESSION | flags::NON_INTERACTIVE_MODE);
    let helper = TaskHelper::new("reconcile", session.clone(), request)
        .with_exclusive(manager.exclusive_registry(), exclusive_key(&vm_uuid));
    let mut body = ReconcileTask::new(
        current,
        Arc::clone(&wanted),
        backend.clone(),
        Arc::clone(&manager),
    );
    if args.edit {
        body = body.as_edit();
    }
    let task = Task::new(helper, body);
    let job_id = task.helper().job_uuid();
    manager.register_task(task.clone())?;

    info!(job_id = %job_id, vm_uuid = %vm_uuid, edit = args.edit, "Starting reconciliation");
    let op = TimedOperation::start("reconcile");
    if task.clone().start() {
        tokio::select! {
            _ = task.wait() => {}
            _ = tokio::signal::ctrl_c() => {
                warn!(job_id = %job_id, "Interrupted, cancelling reconciliation");
                let cancel = RequestPackage::new(CommandType::JOB_CANCEL, job_id.to_string());
                manager.cancel_task(session.clone(), &job_id, &cancel)?;
                task.wait().await;
            }
        }
    }
    op.finish();

    for entry in backend.journal() {
        debug!(call = %entry, "Backend call");
    }

    let code = task.helper().last_error_code();
    if code.is_succeeded() {
        if let Some(output) = &args.output {
            save_ve_config(&wanted, output)?;
            info!(path = %output.display(), "Resulting configuration written");
        }
    }

    manager.shutdown(config.tasks.shutdown_timeout()).await;
    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dispatch_core::backup::{HardDisk, VeState};
    use dispatch_core::testing::helper;
    use dispatch_core::ExclusiveRegistry;
    use std::path::PathBuf;
    use tempfile::TempDir;

    const STOPPED_VM: &str = "uuid: vm1\nhome: /vz/vm1/config.pvs\ntype: vm\nhard_disks:\n  - index: 0\n    storage_url: /vz/vm1/harddisk.hdd\n";

    fn with_backup(url: &str) -> String {
        format!("{STOPPED_VM}  - index: 1\n    storage_url: {url}\n")
    }

    fn write_file(dir: &TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    fn reconcile_args(from: PathBuf, to: PathBuf) -> ReconcileArgs {
        ReconcileArgs {
            from,
            to,
            plan: false,
            edit: false,
            output: None,
        }
    }

    #[test]
    fn test_load_ve_config() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "vm.yaml", &with_backup("backup://b1/d1"));

        let config = load_ve_config(&path).unwrap();
        let config = config.read().unwrap();

        assert_eq!(config.uuid, "vm1");
        assert_eq!(config.home_dir(), "/vz/vm1");
        assert_eq!(config.hard_disks.len(), 2);
        let disk = config.hard_disks[1].read().unwrap();
        assert_eq!(disk.storage_url, "backup://b1/d1");
        assert!(disk.enabled);
    }

    #[test]
    fn test_plan_lists_events_by_phase() {
        let dir = TempDir::new().unwrap();
        let current = load_ve_config(&write_file(&dir, "a.yaml", &with_backup("backup://b1/d1"))).unwrap();
        let wanted = load_ve_config(&write_file(&dir, "b.yaml", &with_backup("backup://b2/d1"))).unwrap();

        let plan = Plan::build(&current, &wanted).unwrap();

        assert_eq!(plan.len(), 2);
        assert_eq!(
            plan.to_string(),
            "disabled:\n  disable vm1 hdd1 backup://b1/d1\nenabled:\n  enable vm1 hdd1 backup://b2/d1\n"
        );

        let same = Plan::build(&current, &current).unwrap();
        assert!(same.is_empty());
        assert_eq!(same.to_string(), "nothing to do\n");
    }

    #[test]
    fn test_plan_rejects_duplicates() {
        let dir = TempDir::new().unwrap();
        let current = load_ve_config(&write_file(&dir, "a.yaml", STOPPED_VM)).unwrap();
        let duplicated = format!(
            "{}  - index: 2\n    storage_url: backup://b1/d1\n",
            with_backup("backup://b1/d1")
        );
        let wanted = load_ve_config(&write_file(&dir, "b.yaml", &duplicated)).unwrap();

        let err = Plan::build(&current, &wanted).err().unwrap();
        assert!(err.to_string().contains("transition rejected"));
    }

    #[tokio::test]
    async fn test_run_attaches_and_writes_output() {
        let dir = TempDir::new().unwrap();
        let mut args = reconcile_args(
            write_file(&dir, "a.yaml", STOPPED_VM),
            write_file(&dir, "b.yaml", &with_backup("backup://b1/d1")),
        );
        let output = dir.path().join("out.yaml");
        args.output = Some(output.clone());

        let code = run(&Config::default(), &args).await.unwrap();

        assert_eq!(code, ResultCode::Success);
        let written = load_ve_config(&output).unwrap();
        let written = written.read().unwrap();
        assert_eq!(written.hard_disks[1].read().unwrap().system_name, "/dev/buse1");
    }

    #[tokio::test]
    async fn test_run_plan_only() {
        let dir = TempDir::new().unwrap();
        let mut args = reconcile_args(
            write_file(&dir, "a.yaml", STOPPED_VM),
            write_file(&dir, "b.yaml", &with_backup("backup://b1/d1")),
        );
        args.plan = true;
        args.output = Some(dir.path().join("out.yaml"));

        let code = run(&Config::default(), &args).await.unwrap();

        assert_eq!(code, ResultCode::Success);
        assert!(!dir.path().join("out.yaml").exists());
    }

    #[tokio::test]
    async fn test_run_rejects_other_ve() {
        let dir = TempDir::new().unwrap();
        let other = STOPPED_VM.replace("uuid: vm1", "uuid: vm2");
        let args = reconcile_args(
            write_file(&dir, "a.yaml", STOPPED_VM),
            write_file(&dir, "b.yaml", &other),
        );

        let code = run(&Config::default(), &args).await.unwrap();
        assert_eq!(code, ResultCode::InvalidArgument);
    }

    #[tokio::test]
    async fn test_edit_succeeds_in_any_run_state() {
        let dir = TempDir::new().unwrap();
        let mut args = reconcile_args(
            write_file(&dir, "a.yaml", &with_backup("backup://b1/d1")),
            write_file(&dir, "b.yaml", STOPPED_VM),
        );
        args.edit = true;

        let code = run(&Config::default(), &args).await.unwrap();
        assert_eq!(code, ResultCode::Success);

        let mut running = Config::default();
        running.backup.ve_states.insert("vm1".to_string(), VeState::Running);
        let code = run(&running, &args).await.unwrap();
        assert_eq!(code, ResultCode::Success);
    }

    #[tokio::test]
    async fn test_second_reconciliation_of_same_ve_is_refused() {
        let backend = Arc::new(MockBackupBackend::new());
        let manager = Arc::new(TaskManager::new());
        let registry: Arc<ExclusiveRegistry> = manager.exclusive_registry();
        let config = || {
            let config = VeConfig {
                uuid: "vm1".to_string(),
                home: "/vz/vm1/config.pvs".to_string(),
                hard_disks: vec![dispatch_core::backup::share(HardDisk::backed_by(1, "backup://b1/d1"))],
                ..VeConfig::default()
            };
            Arc::new(RwLock::new(config))
        };

        let (first, _) = helper("reconcile");
        let first = first.with_exclusive(registry.clone(), exclusive_key("vm1"));
        assert!(first.lock_to_execute());

        let (second, client) = helper("reconcile");
        let second = second.with_exclusive(registry.clone(), exclusive_key("vm1"));
        let task = Task::new(
            second,
            ReconcileTask::new(config(), config(), backend.clone(), manager.clone()),
        );
        assert!(task.clone().start());
        task.wait().await;

        assert_eq!(client.codes(), vec![ResultCode::ExclusiveTaskRunning]);
        assert!(backend.journal().is_empty());
        assert!(registry.is_claimed(&exclusive_key("vm1")));

        drop(first);
        assert!(!registry.is_claimed(&exclusive_key("vm1")));
    }
}
