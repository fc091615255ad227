//! End-to-end builds of the python web plan against a scripted runner.
//!
//! The runner stands in for apt-get, pip and echo: package installs write
//! marker files into the snapshot, and a dependency marked as native only
//! builds when the compiler from `build-essential` is present.

use async_trait::async_trait;
use kiln_core::builder::{
    BuildContext, BuildError, BuildOptions, BuildPlan, CacheManager, Executor, ImageBuilder,
    LocalBaseStore, PlanError, PlanSource, Preset, RunInvocation, RunOutcome, RunnerError,
    Snapshot, Stage,
};
use kiln_core::builder::plan::APT_INDEX_CACHE;
use kiln_core::builder::snapshot::resolve_path;
use kiln_core::{paths, KilnError};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

const COMPILER: &str = "/usr/bin/gcc";
const SITE_PACKAGES: &str = "/usr/local/lib/python3.12/site-packages";
const APT_INDEX_FILE: &str = "/var/lib/apt/lists/deb.debian.org_Packages";

#[derive(Default)]
struct ScriptedRunner {
    commands: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    fn count(&self, needle: &str) -> usize {
        self.commands.lock().unwrap().iter().filter(|c| c.contains(needle)).count()
    }
}

fn fail(message: &str) -> RunOutcome {
    RunOutcome { exit_code: 1, stdout: String::new(), stderr: message.to_string() }
}

#[async_trait]
impl kiln_core::builder::CommandRunner for ScriptedRunner {
    async fn run(
        &self,
        rootfs: &mut Snapshot,
        invocation: &RunInvocation,
    ) -> Result<RunOutcome, RunnerError> {
        let command = invocation.command.to_string();
        self.commands.lock().unwrap().push(command.clone());

        if command.contains("apt-get") {
            if command.contains("missing-pkg") {
                return Ok(fail("E: Unable to locate package missing-pkg"));
            }
            if command.contains("apt-get update") {
                rootfs.insert_file(APT_INDEX_FILE, b"index".to_vec(), 0o644).unwrap();
            }
            if command.contains("build-essential") {
                rootfs.insert_file(COMPILER, b"gcc".to_vec(), 0o755).unwrap();
            }
            return Ok(RunOutcome::default());
        }

        // `echo $NAME > /path`, expanded from the invocation environment
        if let ["echo", var, ">", target] = command.split_whitespace().collect::<Vec<_>>().as_slice() {
            let value = match var.strip_prefix('$') {
                Some(name) => invocation.env.get(name).cloned().unwrap_or_default(),
                None => var.to_string(),
            };
            rootfs.insert_file(target, value.into_bytes(), 0o644).unwrap();
            return Ok(RunOutcome::default());
        }

        if command.contains("pip install") {
            let words: Vec<&str> = command.split_whitespace().collect();
            let Some(manifest) = words.windows(2).find(|w| w[0] == "-r").map(|w| w[1]) else {
                return Ok(fail("no manifest"));
            };
            let path = resolve_path(&invocation.workdir, manifest);
            let Some(content) = rootfs.read_file(&path).map(|d| String::from_utf8_lossy(d).to_string())
            else {
                return Ok(fail("Could not open requirements file"));
            };

            for requirement in content.lines().map(str::trim).filter(|l| !l.is_empty()) {
                if requirement == "does-not-exist" {
                    return Ok(fail("ERROR: No matching distribution found for does-not-exist"));
                }
                if requirement.starts_with("native-") && !rootfs.contains(COMPILER) {
                    return Ok(fail("error: command 'gcc' failed: No such file or directory"));
                }
                let module = format!("{}/{}/__init__.py", SITE_PACKAGES, requirement);
                rootfs.insert_file(&module, requirement.as_bytes().to_vec(), 0o644).unwrap();
            }
            return Ok(RunOutcome::default());
        }

        Ok(fail("unexpected command"))
    }
}

struct Fixture {
    _temp: TempDir,
    data_dir: PathBuf,
    context: PathBuf,
    runner: Arc<ScriptedRunner>,
}

impl Fixture {
    fn new(requirements: &str) -> Self {
        let temp = TempDir::new().unwrap();
        let data_dir = temp.path().join("data");

        let base = paths::bases_dir_in(&data_dir).join("python/3.12-slim");
        std::fs::create_dir_all(base.join("rootfs/usr/local/bin")).unwrap();
        std::fs::create_dir_all(base.join("rootfs/var/lib/apt/lists")).unwrap();
        std::fs::write(base.join("rootfs/usr/local/bin/python"), "python").unwrap();
        std::fs::write(base.join("config.json"), r#"{"env": {"LANG": "C.UTF-8"}}"#).unwrap();

        let context = temp.path().join("app");
        std::fs::create_dir_all(&context).unwrap();
        std::fs::write(context.join("requirements.txt"), requirements).unwrap();
        std::fs::write(context.join("app.py"), "app.run(port=5000)\n").unwrap();

        Self { _temp: temp, data_dir, context, runner: Arc::new(ScriptedRunner::default()) }
    }

    fn builder(&self) -> ImageBuilder {
        let resolver = LocalBaseStore::new(paths::bases_dir_in(&self.data_dir));
        ImageBuilder::new(self.runner.clone(), Arc::new(resolver), &self.data_dir, u64::MAX)
    }

    fn options(&self) -> BuildOptions {
        BuildOptions {
            context_path: self.context.clone(),
            source: PlanSource::Preset(Preset::PythonWeb),
            name: "web".to_string(),
            tag: "latest".to_string(),
            ..BuildOptions::default()
        }
    }

    fn write(&self, file: &str, content: &str) {
        std::fs::write(self.context.join(file), content).unwrap();
    }

    fn cache(&self) -> CacheManager {
        CacheManager::with_config(paths::cache_dir_in(&self.data_dir), u64::MAX).unwrap()
    }
}

fn cached_steps(result: &kiln_core::BuildResult) -> Vec<usize> {
    result.steps.iter().filter(|s| s.cached).map(|s| s.step).collect()
}

#[tokio::test]
async fn test_python_web_build() {
    let fixture = Fixture::new("flask\nnative-ujson\n");
    let builder = fixture.builder();
    let result = builder.build(&fixture.options()).await.unwrap();

    assert_eq!(result.steps.len(), 8);
    assert_eq!(fixture.runner.count("apt-get install -y build-essential"), 1);
    assert_eq!(fixture.runner.count("pip install --upgrade pip && pip install -r requirements.txt"), 1);

    let store = builder.store();
    assert_eq!(store.resolve("web:latest").unwrap(), result.image_id);
    let rootfs = store.rootfs(&result.image_id).unwrap();
    assert!(rootfs.contains("/app/requirements.txt"));
    assert!(rootfs.contains("/app/app.py"));
    assert!(rootfs.contains(&format!("{}/native-ujson/__init__.py", SITE_PACKAGES)));
    assert!(rootfs.contains("/usr/local/bin/python"));
}

#[tokio::test]
async fn test_ordering_rules() {
    let mut plan = BuildPlan::python_web();
    plan.stages.swap(3, 4);
    assert!(matches!(plan.validate(), Err(PlanError::PrerequisitesAfterDependencies { position: 5 })));

    // Run anyway: a native dependency cannot build before the toolchain exists
    let fixture = Fixture::new("native-ujson\n");
    let context = BuildContext::open(&fixture.context).unwrap();
    let resolver = LocalBaseStore::new(paths::bases_dir_in(&fixture.data_dir));
    let executor = Executor::new(fixture.runner.clone(), Arc::new(resolver));

    let err = executor.run_plan(&plan, &context, &mut fixture.cache()).await.unwrap_err();
    match err {
        BuildError::DependencyInstall { step, reason, .. } => {
            assert_eq!(step, 4);
            assert!(reason.contains("gcc"));
        }
        other => panic!("Expected DependencyInstall, got {:?}", other),
    }

    let mut source_first = BuildPlan::python_web();
    let copy = source_first.stages.remove(5);
    source_first.stages.insert(2, copy);
    assert!(source_first.validate().is_err());
}

#[tokio::test]
async fn test_unchanged_inputs_give_same_image() {
    let fixture = Fixture::new("flask\n");
    let builder = fixture.builder();

    let first = builder.build(&fixture.options()).await.unwrap();
    let second = builder.build(&fixture.options()).await.unwrap();

    assert_eq!(first.image_id, second.image_id);
    assert_eq!(cached_steps(&second), vec![2, 3, 4, 5, 6]);
    assert_eq!(fixture.runner.count("pip install"), 1);
    assert_eq!(first.manifest.config, second.manifest.config);
    assert_eq!(builder.store().list().unwrap().len(), 1);
}

#[tokio::test]
async fn test_source_change_reuses_dependency_install() {
    let fixture = Fixture::new("flask\n");
    let builder = fixture.builder();
    let first = builder.build(&fixture.options()).await.unwrap();

    fixture.write("app.py", "app.run(port=5000, debug=True)\n");
    let second = builder.build(&fixture.options()).await.unwrap();

    assert_eq!(cached_steps(&second), vec![2, 3, 4, 5]);
    assert_eq!(fixture.runner.count("pip install"), 1);
    assert_ne!(first.image_id, second.image_id);
}

#[tokio::test]
async fn test_manifest_change_reruns_dependency_install() {
    let fixture = Fixture::new("flask\n");
    let builder = fixture.builder();
    builder.build(&fixture.options()).await.unwrap();

    fixture.write("requirements.txt", "flask\ngunicorn\n");
    let second = builder.build(&fixture.options()).await.unwrap();

    assert_eq!(cached_steps(&second), vec![2]);
    assert_eq!(fixture.runner.count("pip install"), 2);
    let rootfs = builder.store().rootfs(&second.image_id).unwrap();
    assert!(rootfs.contains(&format!("{}/gunicorn/__init__.py", SITE_PACKAGES)));
}

#[tokio::test]
async fn test_package_index_removed() {
    let fixture = Fixture::new("flask\n");
    let builder = fixture.builder();
    let result = builder.build(&fixture.options()).await.unwrap();

    let rootfs = builder.store().rootfs(&result.image_id).unwrap();
    assert!(rootfs.contains(COMPILER));
    assert!(!rootfs.has_children(APT_INDEX_CACHE));
}

#[tokio::test]
async fn test_unresolvable_dependency_publishes_nothing() {
    let fixture = Fixture::new("flask\ndoes-not-exist\n");
    let builder = fixture.builder();

    let err = builder.build(&fixture.options()).await.unwrap_err();
    assert_eq!(err.failed_step(), Some(5));
    match &err {
        KilnError::Build(BuildError::DependencyInstall { reason, .. }) => {
            assert!(reason.contains("No matching distribution"));
        }
        other => panic!("Expected DependencyInstall, got {:?}", other),
    }
    assert!(builder.store().list().unwrap().is_empty());
}

#[tokio::test]
async fn test_failed_system_install_publishes_nothing() {
    let fixture = Fixture::new("flask\n");
    fixture.write("Dockerfile", &BuildPlan::python_web().render().replace("build-essential", "missing-pkg"));
    let options = BuildOptions {
        source: PlanSource::Dockerfile(PathBuf::from("Dockerfile")),
        ..fixture.options()
    };
    let builder = fixture.builder();

    let err = builder.build(&options).await.unwrap_err();
    assert_eq!(err.failed_step(), Some(4));
    match &err {
        KilnError::Build(BuildError::PrerequisiteInstall { step, description, reason }) => {
            assert_eq!(*step, 4);
            assert!(description.contains("apt-get install -y missing-pkg"));
            assert!(reason.contains("Unable to locate package"));
        }
        other => panic!("Expected PrerequisiteInstall, got {:?}", other),
    }
    // Fail-fast: nothing after the install ran
    assert_eq!(fixture.runner.count("pip install"), 0);
    assert!(builder.store().list().unwrap().is_empty());
    assert!(builder.store().resolve("web:latest").is_err());
}

#[tokio::test]
async fn test_index_cache_restored_later_is_cleanup_violation() {
    let fixture = Fixture::new("flask\n");
    let dockerfile = format!("{}RUN apt-get update\n", BuildPlan::python_web().render());
    fixture.write("Dockerfile", &dockerfile);
    let options = BuildOptions {
        source: PlanSource::Dockerfile(PathBuf::from("Dockerfile")),
        ..fixture.options()
    };
    let builder = fixture.builder();

    let err = builder.build(&options).await.unwrap_err();
    match &err {
        KilnError::Build(BuildError::CleanupViolation { paths }) => {
            assert_eq!(paths, &vec![APT_INDEX_FILE.to_string()]);
        }
        other => panic!("Expected CleanupViolation, got {:?}", other),
    }
    assert!(builder.store().list().unwrap().is_empty());
    assert!(builder.store().resolve("web:latest").is_err());
}

#[tokio::test]
async fn test_build_arg_reaches_run_and_cache_key() {
    let fixture = Fixture::new("flask\n");
    fixture.write(
        "Dockerfile",
        "FROM python:3.12-slim\nARG GREETING=one\nRUN echo $GREETING > /greeting\n",
    );
    let builder = fixture.builder();
    let build = |value: &str| {
        let mut build_args = HashMap::new();
        build_args.insert("GREETING".to_string(), value.to_string());
        BuildOptions {
            source: PlanSource::Dockerfile(PathBuf::from("Dockerfile")),
            build_args,
            ..fixture.options()
        }
    };

    let two = builder.build(&build("two")).await.unwrap();
    let rootfs = builder.store().rootfs(&two.image_id).unwrap();
    assert_eq!(rootfs.read_file("/greeting"), Some(&b"two"[..]));
    assert_eq!(two.steps[1].description, "ARG GREETING=two");

    let three = builder.build(&build("three")).await.unwrap();
    assert!(!three.steps[2].cached);
    assert_eq!(fixture.runner.count("echo"), 2);
    let rootfs = builder.store().rootfs(&three.image_id).unwrap();
    assert_eq!(rootfs.read_file("/greeting"), Some(&b"three"[..]));

    let again = builder.build(&build("two")).await.unwrap();
    assert!(again.steps[2].cached);
    assert_eq!(again.image_id, two.image_id);
    assert_eq!(fixture.runner.count("echo"), 2);
}

#[tokio::test]
async fn test_missing_base_is_resolution_error() {
    let fixture = Fixture::new("flask\n");
    std::fs::remove_dir_all(paths::bases_dir_in(&fixture.data_dir)).unwrap();

    let err = fixture.builder().build(&fixture.options()).await.unwrap_err();
    assert!(matches!(err, KilnError::Build(BuildError::Resolution { step: 1, .. })));
    assert_eq!(fixture.runner.count(""), 0);
}

#[tokio::test]
async fn test_launch_contract() {
    let fixture = Fixture::new("flask\n");
    let result = fixture.builder().build(&fixture.options()).await.unwrap();

    let launch = result.manifest.config.launch_spec().unwrap();
    assert_eq!(launch.argv, vec!["python", "app.py"]);
    assert_eq!(launch.working_dir, "/app");
    assert_eq!(launch.env.get("LANG").map(String::as_str), Some("C.UTF-8"));
    assert_eq!(launch.env.len(), 2);
    assert!(result.manifest.config.exposed_ports.contains("5000/tcp"));
}

#[tokio::test]
async fn test_dockerfile_build_honors_ignore_file() {
    let fixture = Fixture::new("flask\n");
    fixture.write("Dockerfile", &BuildPlan::python_web().render());
    fixture.write(".dockerignore", "secrets.env\nDockerfile\n");
    fixture.write("secrets.env", "TOKEN=x\n");

    let options = BuildOptions {
        source: PlanSource::Dockerfile(PathBuf::from("Dockerfile")),
        ..fixture.options()
    };
    let builder = fixture.builder();
    let result = builder.build(&options).await.unwrap();

    let rootfs = builder.store().rootfs(&result.image_id).unwrap();
    assert!(rootfs.contains("/app/app.py"));
    assert!(!rootfs.contains("/app/secrets.env"));
    assert!(!rootfs.contains("/app/Dockerfile"));
    assert_eq!(result.steps[2].description, "COPY requirements.txt .");
}

#[test]
fn test_preset_stage_kinds() {
    let plan = Preset::PythonWeb.plan();
    assert!(matches!(plan.stages[0], Stage::SelectBase { .. }));
    assert!(plan.installs_system_packages());
    assert!(plan.render().starts_with("FROM python:3.12-slim\nWORKDIR /app\n"));
}
