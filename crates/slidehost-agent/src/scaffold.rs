use std::{
    fs,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use anyhow::Context;
use serde_json::{Map, Value};
use slidehost_process::{PresentationId, PresentationRequest};
use tokio::sync::Mutex;

use crate::{error::AgentError, frontmatter, install::InstallPlan};

pub const ENTRY_FILE: &str = "slides.md";
pub const STYLE_FILE: &str = "style.css";
const MANIFEST_FILE: &str = "package.json";
const PRESENTATIONS_DIR: &str = "presentations";
const TEMPLATE_DIR: &str = "template";

/// Where the renderer's npm dependencies come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyMode {
    /// Renderer is installed globally; projects only get their own files.
    None,
    /// Copy a shared prebuilt template, installing per request as a fallback.
    Template,
    /// Always install inside the working directory.
    PerRequest,
}

#[derive(Debug, Clone)]
pub struct ScaffoldConfig {
    pub root: PathBuf,
    pub dependencies: DependencyMode,
    /// Sub-paths a template must contain to be considered complete.
    pub required_paths: Vec<String>,
    pub install: InstallPlan,
    pub manifest: Value,
    pub frontmatter_defaults: Map<String, Value>,
}

impl ScaffoldConfig {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            dependencies: DependencyMode::Template,
            required_paths: vec![
                MANIFEST_FILE.to_string(),
                "node_modules/@slidev/cli".to_string(),
                "node_modules/@slidev/theme-default".to_string(),
            ],
            install: InstallPlan::default(),
            manifest: default_manifest(),
            frontmatter_defaults: frontmatter::default_frontmatter(),
        }
    }
}

pub fn default_manifest() -> Value {
    serde_json::json!({
        "name": "slidehost-presentation",
        "private": true,
        "type": "module",
        "scripts": {
            "dev": "slidev",
            "build": "slidev build",
            "export": "slidev export"
        },
        "dependencies": {
            "@slidev/cli": "^51.0.0",
            "@slidev/theme-default": "latest",
            "vue": "^3.5.0"
        }
    })
}

/// Creates and removes per-presentation working directories.
#[derive(Debug, Clone)]
pub struct Scaffolder {
    inner: Arc<ScaffolderInner>,
}

#[derive(Debug)]
struct ScaffolderInner {
    cfg: ScaffoldConfig,
    build_lock: Mutex<()>,
    template_failed: AtomicBool,
}

impl Scaffolder {
    pub fn new(cfg: ScaffoldConfig) -> Self {
        Self {
            inner: Arc::new(ScaffolderInner {
                cfg,
                build_lock: Mutex::new(()),
                template_failed: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &ScaffoldConfig {
        &self.inner.cfg
    }

    pub fn presentations_root(&self) -> PathBuf {
        self.inner.cfg.root.join(PRESENTATIONS_DIR)
    }

    pub fn template_dir(&self) -> PathBuf {
        self.inner.cfg.root.join(TEMPLATE_DIR)
    }

    pub fn dir_for(&self, id: &PresentationId) -> PathBuf {
        self.presentations_root().join(id.as_str())
    }

    pub async fn materialize(
        &self,
        req: &PresentationRequest,
    ) -> Result<(PresentationId, PathBuf), AgentError> {
        let root = self.presentations_root();
        tokio::fs::create_dir_all(&root)
            .await
            .with_context(|| format!("create {}", root.display()))
            .map_err(|e| AgentError::filesystem(&e))?;

        let id = PresentationId::new();
        let dir = self.dir_for(&id);
        if tokio::fs::try_exists(&dir).await.unwrap_or(true) {
            return Err(AgentError::Filesystem(format!(
                "working directory already exists: {}",
                dir.display()
            )));
        }

        match self.populate(req, &dir).await {
            Ok(()) => {
                tracing::info!(%id, dir = %dir.display(), "presentation scaffolded");
                Ok((id, dir))
            }
            Err(err) => {
                if let Err(cleanup_err) = self.cleanup(&dir).await {
                    tracing::warn!(%id, error = %cleanup_err, "failed to remove partial scaffold");
                }
                Err(err)
            }
        }
    }

    async fn populate(&self, req: &PresentationRequest, dir: &Path) -> Result<(), AgentError> {
        let cfg = &self.inner.cfg;
        let from_template =
            cfg.dependencies == DependencyMode::Template && self.template_usable().await;

        if from_template {
            let src = self.template_dir();
            let dst = dir.to_path_buf();
            tokio::task::spawn_blocking(move || copy_dir(&src, &dst))
                .await
                .map_err(|e| AgentError::Internal(anyhow::anyhow!("template copy task: {e}")))?
                .context("copy template")
                .map_err(|e| AgentError::filesystem(&e))?;
        } else {
            tokio::fs::create_dir(dir)
                .await
                .with_context(|| format!("create {}", dir.display()))
                .map_err(|e| AgentError::filesystem(&e))?;
        }

        self.write_project_files(req, dir)
            .await
            .map_err(|e| AgentError::filesystem(&e))?;

        let needs_install = match cfg.dependencies {
            DependencyMode::None => false,
            DependencyMode::Template => !from_template,
            DependencyMode::PerRequest => true,
        };
        if needs_install {
            tracing::info!(dir = %dir.display(), "installing renderer dependencies for this request");
            cfg.install
                .run(dir)
                .await
                .map_err(|e| AgentError::filesystem(&e))?;
        }
        Ok(())
    }

    async fn write_project_files(
        &self,
        req: &PresentationRequest,
        dir: &Path,
    ) -> anyhow::Result<()> {
        let cfg = &self.inner.cfg;

        let manifest = serde_json::to_vec_pretty(&cfg.manifest).context("serialize manifest")?;
        tokio::fs::write(dir.join(MANIFEST_FILE), manifest)
            .await
            .context("write package.json")?;

        let fields = frontmatter::merge(&cfg.frontmatter_defaults, req);
        let doc = frontmatter::render_document(&fields, &req.content);
        tokio::fs::write(dir.join(ENTRY_FILE), doc)
            .await
            .context("write slides.md")?;

        if let Some(css) = req.custom_css.as_ref().filter(|c| !c.trim().is_empty()) {
            tokio::fs::write(dir.join(STYLE_FILE), css)
                .await
                .context("write style.css")?;
        }

        for sub in ["components", "public"] {
            tokio::fs::create_dir_all(dir.join(sub))
                .await
                .with_context(|| format!("create {sub}/"))?;
        }
        Ok(())
    }

    /// Removes a working directory. Already gone counts as success.
    pub async fn cleanup(&self, dir: &Path) -> Result<(), AgentError> {
        let root = self.presentations_root();
        if dir == root || !dir.starts_with(&root) {
            return Err(AgentError::Filesystem(format!(
                "refusing to remove {} outside {}",
                dir.display(),
                root.display()
            )));
        }
        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => {
                tracing::debug!(dir = %dir.display(), "working directory removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AgentError::Filesystem(format!(
                "remove {}: {e}",
                dir.display()
            ))),
        }
    }

    pub async fn template_is_valid(&self) -> bool {
        layout_errors(&self.template_dir(), &self.inner.cfg.required_paths)
            .await
            .is_empty()
    }

    /// Whether new projects can be copied from the template right now.
    /// An incomplete template schedules a background rebuild and answers `false`.
    async fn template_usable(&self) -> bool {
        if self.template_is_valid().await {
            return true;
        }
        if !self.inner.template_failed.load(Ordering::SeqCst)
            && self.inner.build_lock.try_lock().is_ok()
        {
            self.warm_template();
        }
        false
    }

    /// Builds the template in the background.
    pub fn warm_template(&self) {
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.ensure_template().await {
                tracing::warn!(error = %e, "template build failed; requests will install dependencies themselves");
            }
        });
    }

    /// Validates the template, rebuilding it when incomplete.
    pub async fn ensure_template(&self) -> Result<PathBuf, AgentError> {
        let _guard = self.inner.build_lock.lock().await;
        let template = self.template_dir();
        if self.template_is_valid().await {
            return Ok(template);
        }

        let cfg = &self.inner.cfg;
        let errs = layout_errors(&template, &cfg.required_paths).await;
        tracing::info!(
            dir = %template.display(),
            missing = %errs.join(", "),
            "building presentation template"
        );

        let staging = cfg.root.join(format!(
            "{TEMPLATE_DIR}.staging.{}",
            std::process::id()
        ));
        let built: anyhow::Result<()> = async {
            if tokio::fs::try_exists(&staging).await.unwrap_or(false) {
                tokio::fs::remove_dir_all(&staging)
                    .await
                    .context("clear stale template staging dir")?;
            }
            tokio::fs::create_dir_all(&staging)
                .await
                .context("create template staging dir")?;
            let manifest =
                serde_json::to_vec_pretty(&cfg.manifest).context("serialize manifest")?;
            tokio::fs::write(staging.join(MANIFEST_FILE), manifest)
                .await
                .context("write template package.json")?;

            cfg.install.run(&staging).await?;

            let errs = layout_errors(&staging, &cfg.required_paths).await;
            if !errs.is_empty() {
                anyhow::bail!("template incomplete after install: {}", errs.join(", "));
            }

            if tokio::fs::try_exists(&template).await.unwrap_or(false) {
                tokio::fs::remove_dir_all(&template)
                    .await
                    .context("remove incomplete template")?;
            }
            tokio::fs::rename(&staging, &template)
                .await
                .context("move template into place")?;
            Ok(())
        }
        .await;

        match built {
            Ok(()) => {
                self.inner.template_failed.store(false, Ordering::SeqCst);
                tracing::info!(dir = %template.display(), "presentation template ready");
                Ok(template)
            }
            Err(e) => {
                self.inner.template_failed.store(true, Ordering::SeqCst);
                let _ = tokio::fs::remove_dir_all(&staging).await;
                Err(AgentError::filesystem(&e.context("build presentation template")))
            }
        }
    }
}

async fn layout_errors(dir: &Path, required: &[String]) -> Vec<String> {
    let mut errs = Vec::new();
    for rel in required {
        if !tokio::fs::try_exists(dir.join(rel)).await.unwrap_or(false) {
            errs.push(rel.clone());
        }
    }
    errs
}

/// Recursive copy. Symlinks are recreated as symlinks so `node_modules/.bin`
/// entries keep resolving relative to their own package.
fn copy_dir(src: &Path, dst: &Path) -> anyhow::Result<()> {
    fs::create_dir_all(dst).with_context(|| format!("create {}", dst.display()))?;
    for entry in fs::read_dir(src).with_context(|| format!("read {}", src.display()))? {
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            copy_dir(&src_path, &dst_path)?;
            continue;
        }
        if file_type.is_file() {
            fs::copy(&src_path, &dst_path)
                .with_context(|| format!("copy {}", src_path.display()))?;
            continue;
        }
        if file_type.is_symlink() {
            copy_symlink(&src_path, &dst_path)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(src: &Path, dst: &Path) -> anyhow::Result<()> {
    let target = fs::read_link(src).with_context(|| format!("read link {}", src.display()))?;
    std::os::unix::fs::symlink(&target, dst)
        .with_context(|| format!("link {} -> {}", dst.display(), target.display()))?;
    Ok(())
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, dst: &Path) -> anyhow::Result<()> {
    let meta = fs::metadata(src)
        .with_context(|| format!("resolve symlink {}", src.display()))?;
    if meta.is_dir() {
        copy_dir(src, dst)
    } else {
        fs::copy(src, dst)?;
        Ok(())
    }
}
