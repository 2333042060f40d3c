//! The standard bootstrap pipeline
//!
//! Order matters: later steps rely on earlier side effects (the environment
//! manager must exist before the isolated environment is created in it, the
//! visualization server before its configuration). The order is the pipeline
//! position; there is no separate dependency graph.

use crate::config::{BootstrapConfig, SharedFilesystem};
use crate::errors::{BootstrapError, InternalError, Result};
use crate::orchestrator::Orchestrator;
use crate::runner::CommandSpec;
use crate::step::{ActionContext, ShellAction, Step, StepAction, StepPolicy};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Remote-visualization server package location
const DCV_BASE_URL: &str = "https://d1uj6qtbmh3dt5.cloudfront.net";
const DCV_ARCHIVE: &str = "nice-dcv-ubuntu2204-x86_64.tgz";
const DCV_WEB_PORT: u16 = 8443;

const AWS_CLI_URL: &str = "https://awscli.amazonaws.com/awscli-exe-linux-x86_64.zip";
const EFS_UTILS_REPO: &str = "https://github.com/aws/efs-utils";
const MINICONDA_URL: &str =
    "https://repo.anaconda.com/miniconda/Miniconda3-latest-Linux-x86_64.sh";
const NVIDIA_CONTAINER_KEY_URL: &str =
    "https://nvidia.github.io/libnvidia-container/gpgkey";
const NVIDIA_CONTAINER_LIST_URL: &str =
    "https://nvidia.github.io/libnvidia-container/stable/deb/nvidia-container-toolkit.list";
const TORCH_INDEX_URL: &str = "https://download.pytorch.org/whl/cu121";
const NVIDIA_PYPI_URL: &str = "https://pypi.nvidia.com";

/// Name of the step that installs the session watcher unit
pub const SESSION_WATCHER_STEP: &str = "session-watcher";

/// Name of the shared-filesystem step appended when configured
pub const EFS_MOUNT_STEP: &str = "efs-mount";

/// Names and policies of the fixed pipeline, in order
pub const STANDARD_STEPS: [(&str, StepPolicy); 17] = [
    ("system-update", StepPolicy::Critical),
    ("disable-nouveau", StepPolicy::Optional),
    ("nvidia-driver", StepPolicy::Critical),
    ("desktop-environment", StepPolicy::Critical),
    ("remove-initial-setup", StepPolicy::Optional),
    ("dcv-server", StepPolicy::Critical),
    ("dcv-config", StepPolicy::Optional),
    (SESSION_WATCHER_STEP, StepPolicy::Critical),
    ("aws-cli", StepPolicy::Critical),
    ("efs-utils", StepPolicy::Critical),
    ("container-runtime", StepPolicy::Optional),
    ("miniconda", StepPolicy::Critical),
    ("conda-env", StepPolicy::Critical),
    ("ml-libraries", StepPolicy::Optional),
    ("isaac-sim", StepPolicy::Optional),
    ("isaac-lab", StepPolicy::Optional),
    ("browser", StepPolicy::Optional),
];

fn quote(value: &str) -> String {
    shell_words::quote(value).into_owned()
}

fn quote_path(path: &Path) -> String {
    quote(&path.display().to_string())
}

fn apt_install(packages: &str) -> String {
    format!("apt-get install -y --no-install-recommends {}", packages)
}

/// Build the standard pipeline for `config`
pub fn standard_pipeline(config: &BootstrapConfig) -> Result<Orchestrator> {
    let mut steps = Vec::with_capacity(STANDARD_STEPS.len() + 1);
    for (name, policy) in STANDARD_STEPS {
        let step = if name == SESSION_WATCHER_STEP {
            Step::new(name, policy, WatcherServiceAction::from_config(config))
        } else {
            Step::new(name, policy, shell_step(name, config)?)
        };
        steps.push(step);
    }

    if let Some(fs) = &config.shared_filesystem {
        steps.push(Step::optional(
            EFS_MOUNT_STEP,
            EfsMountAction::new(fs.clone(), &config.user),
        ));
    }

    debug!("Built standard pipeline with {} steps", steps.len());
    Orchestrator::new(steps)
}

fn shell_step(name: &str, config: &BootstrapConfig) -> Result<ShellAction> {
    let user = quote(&config.user);
    let service = quote(&config.watcher.service);
    let runtime = &config.runtime;
    let conda = runtime.conda_prefix.join("bin/conda");
    let conda_run = format!(
        "{} run -n {}",
        quote_path(&conda),
        quote(&runtime.env_name)
    );

    let action = match name {
        "system-update" => {
            let action = ShellAction::new()
                .transient_script("apt-get update")
                .transient_script("apt-get -y upgrade");
            match &config.password {
                Some(password) => action.script(format!(
                    "echo {} | chpasswd",
                    quote(&format!("{}:{}", config.user, password))
                )),
                None => action,
            }
        }
        "disable-nouveau" => ShellAction::new()
            .script(
                "printf 'blacklist nouveau\\noptions nouveau modeset=0\\n' \
                 > /etc/modprobe.d/blacklist-nouveau.conf",
            )
            .script("update-initramfs -u"),
        "nvidia-driver" => ShellAction::new()
            .transient_script(apt_install(
                "linux-headers-$(uname -r) ubuntu-drivers-common build-essential",
            ))
            .transient_script("ubuntu-drivers install"),
        "desktop-environment" => ShellAction::new()
            .transient_script(apt_install("ubuntu-desktop-minimal gdm3 mesa-utils"))
            .script(
                "sed -i 's/^#\\?WaylandEnable=.*/WaylandEnable=false/' /etc/gdm3/custom.conf",
            )
            .script("systemctl set-default graphical.target"),
        "remove-initial-setup" => {
            ShellAction::new().script("apt-get remove -y --purge gnome-initial-setup")
        }
        "dcv-server" => ShellAction::new()
            .transient_script(format!(
                "curl -fsSL {}/NICE-GPG-KEY -o /tmp/NICE-GPG-KEY && gpg --import /tmp/NICE-GPG-KEY",
                DCV_BASE_URL
            ))
            .transient_script(format!(
                "curl -fsSL {}/{} -o /tmp/{}",
                DCV_BASE_URL, DCV_ARCHIVE, DCV_ARCHIVE
            ))
            .script(format!(
                "rm -rf /tmp/nice-dcv && mkdir -p /tmp/nice-dcv && \
                 tar -xzf /tmp/{} -C /tmp/nice-dcv --strip-components=1",
                DCV_ARCHIVE
            ))
            .transient_script(
                "cd /tmp/nice-dcv && apt-get install -y ./nice-dcv-server_*.deb ./nice-xdcv_*.deb",
            )
            .script("usermod -aG video dcv")
            .script(format!("systemctl enable --now {}", service)),
        "dcv-config" => ShellAction::new()
            .script(format!(
                "cat > /etc/dcv/dcv.conf <<'EOF'\n{}EOF",
                dcv_conf(config)
            ))
            .script(format!("systemctl restart {}", service)),
        "aws-cli" => ShellAction::new()
            .transient_script(apt_install("unzip curl"))
            .transient_script(format!("curl -fsSL {} -o /tmp/awscliv2.zip", AWS_CLI_URL))
            .script("rm -rf /tmp/aws && unzip -q /tmp/awscliv2.zip -d /tmp")
            .script("/tmp/aws/install --update"),
        "efs-utils" => ShellAction::new()
            .transient_script(apt_install(
                "git binutils rustc cargo pkg-config libssl-dev gettext nfs-common stunnel4",
            ))
            .transient_script(format!(
                "rm -rf /tmp/efs-utils && git clone --depth 1 {} /tmp/efs-utils",
                EFS_UTILS_REPO
            ))
            .script("cd /tmp/efs-utils && ./build-deb.sh")
            .script("apt-get install -y /tmp/efs-utils/build/amazon-efs-utils*.deb"),
        "container-runtime" => ShellAction::new()
            .transient_script("curl -fsSL https://get.docker.com | sh")
            .transient_script(format!(
                "curl -fsSL {} | gpg --batch --yes --dearmor \
                 -o /usr/share/keyrings/nvidia-container-toolkit-keyring.gpg && \
                 curl -fsSL {} | sed 's#deb https://#deb \
                 [signed-by=/usr/share/keyrings/nvidia-container-toolkit-keyring.gpg] https://#g' \
                 > /etc/apt/sources.list.d/nvidia-container-toolkit.list",
                NVIDIA_CONTAINER_KEY_URL, NVIDIA_CONTAINER_LIST_URL
            ))
            .transient_script("apt-get update")
            .transient_script(apt_install("nvidia-container-toolkit"))
            .script("nvidia-ctk runtime configure --runtime=docker")
            .script("systemctl restart docker")
            .script(format!("usermod -aG docker {}", user)),
        "miniconda" => ShellAction::new()
            .transient_script(format!("curl -fsSL {} -o /tmp/miniconda.sh", MINICONDA_URL))
            .script(format!(
                "bash /tmp/miniconda.sh -b -u -p {}",
                quote_path(&runtime.conda_prefix)
            ))
            .script(format!(
                "chown -R {}:{} {}",
                user,
                user,
                quote_path(&runtime.conda_prefix)
            ))
            .command(
                CommandSpec::new(conda.display().to_string())
                    .args(["init", "bash"])
                    .as_user(config.user.clone()),
            ),
        "conda-env" => ShellAction::new().transient(
            CommandSpec::shell(format!(
                "{conda} env list | awk '{{print $1}}' | grep -qx {env} || \
                 {conda} create -y -n {env} python={python}",
                conda = quote_path(&conda),
                env = quote(&runtime.env_name),
                python = quote(&runtime.python_version)
            ))
            .as_user(config.user.clone()),
        ),
        "ml-libraries" => ShellAction::new()
            .transient(
                CommandSpec::shell(format!(
                    "{} pip install torch torchvision --index-url {}",
                    conda_run, TORCH_INDEX_URL
                ))
                .as_user(config.user.clone()),
            )
            .transient(
                CommandSpec::shell(format!(
                    "{} pip install numpy scipy matplotlib tensorboard",
                    conda_run
                ))
                .as_user(config.user.clone()),
            ),
        "isaac-sim" => ShellAction::new()
            .transient(
                CommandSpec::shell(format!("{} pip install --upgrade pip", conda_run))
                    .as_user(config.user.clone()),
            )
            .transient(
                CommandSpec::shell(format!(
                    "{} pip install {} --extra-index-url {}",
                    conda_run,
                    quote(&runtime.isaac_sim_package),
                    NVIDIA_PYPI_URL
                ))
                .env("OMNI_KIT_ACCEPT_EULA", "YES")
                .as_user(config.user.clone()),
            ),
        "isaac-lab" => isaac_lab_action(config, &conda_run),
        "browser" => ShellAction::new().transient_script(apt_install("firefox")),
        other => {
            return Err(BootstrapError::Internal(InternalError::Generic {
                message: format!("no action defined for step '{}'", other),
            }))
        }
    };
    Ok(action)
}

fn isaac_lab_action(config: &BootstrapConfig, conda_run: &str) -> ShellAction {
    let runtime = &config.runtime;
    let dir = quote_path(&config.isaac_lab_dir());

    let mut action = ShellAction::new()
        .transient(
            CommandSpec::shell(format!(
                "test -d {dir}/.git || git clone --branch {git_ref} --depth 1 {repo} {dir}",
                dir = dir,
                git_ref = quote(&runtime.isaac_lab_ref),
                repo = quote(&runtime.isaac_lab_repo)
            ))
            .as_user(config.user.clone()),
        )
        .transient(
            CommandSpec::shell(format!("cd {} && {} ./isaaclab.sh --install", dir, conda_run))
                .env("OMNI_KIT_ACCEPT_EULA", "YES")
                .as_user(config.user.clone()),
        );

    if let Some(url) = &runtime.assets_url {
        action = action
            .transient_script(format!(
                "curl -fsSL {} -o /tmp/isaac-assets.zip",
                quote(url)
            ))
            .script(format!(
                "mkdir -p {dir}/assets && unzip -qo /tmp/isaac-assets.zip -d {dir}/assets",
                dir = dir
            ));
    }

    action.script(format!("chown -R {user}:{user} {}", dir, user = quote(&config.user)))
}

/// Contents of the visualization server configuration
pub fn dcv_conf(config: &BootstrapConfig) -> String {
    format!(
        "[license]\n\
         \n\
         [log]\n\
         level=\"info\"\n\
         \n\
         [session-management]\n\
         create-session=false\n\
         \n\
         [session-management/defaults]\n\
         permissions-file=\"\"\n\
         \n\
         [session-management/automatic-console-session]\n\
         owner=\"{owner}\"\n\
         \n\
         [display]\n\
         target-fps=30\n\
         \n\
         [connectivity]\n\
         web-port={port}\n\
         enable-quic-frontend=true\n\
         \n\
         [security]\n\
         authentication=\"system\"\n",
        owner = config.session_owner(),
        port = DCV_WEB_PORT
    )
}

/// Installs and starts the systemd unit running the session watcher
#[derive(Debug, Clone)]
pub struct WatcherServiceAction {
    unit_path: PathBuf,
    binary: Option<PathBuf>,
    config_path: Option<PathBuf>,
    service: String,
}

impl WatcherServiceAction {
    pub fn from_config(config: &BootstrapConfig) -> Self {
        Self {
            unit_path: config.watcher.unit_path.clone(),
            binary: config.watcher.binary.clone(),
            config_path: config.source.clone(),
            service: config.watcher.service.clone(),
        }
    }

    /// Systemd unit name derived from the unit path
    pub fn unit_name(&self) -> String {
        self.unit_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "dcv-session-watcher.service".to_string())
    }

    fn binary(&self) -> Result<PathBuf> {
        match &self.binary {
            Some(binary) => Ok(binary.clone()),
            None => std::env::current_exe().map_err(|e| {
                BootstrapError::Step(format!("cannot resolve watcher binary: {}", e))
            }),
        }
    }
}

/// Unit file running `<binary> watch [--config <path>]` after `service`
pub fn watcher_unit(binary: &Path, config_path: Option<&Path>, service: &str) -> String {
    let mut exec = format!("{} watch", quote_path(binary));
    if let Some(path) = config_path {
        exec.push_str(&format!(" --config {}", quote_path(path)));
    }
    format!(
        "[Unit]\n\
         Description=Create the console remote desktop session once {service} is active\n\
         After={service}.service network-online.target\n\
         Wants=network-online.target\n\
         \n\
         [Service]\n\
         Type=simple\n\
         ExecStart={exec}\n\
         Restart=on-failure\n\
         RestartSec=30\n\
         \n\
         [Install]\n\
         WantedBy=multi-user.target\n",
        service = service,
        exec = exec
    )
}

#[async_trait]
impl StepAction for WatcherServiceAction {
    async fn run(&self, ctx: &ActionContext<'_>) -> Result<()> {
        let binary = self.binary()?;
        let unit = watcher_unit(&binary, self.config_path.as_deref(), &self.service);
        let unit_dir = self
            .unit_path
            .parent()
            .map(quote_path)
            .unwrap_or_else(|| "/etc/systemd/system".to_string());

        ctx.log(&format!("installing {}", self.unit_path.display()))?;
        ctx.exec(&CommandSpec::shell(format!(
            "mkdir -p {} && cat > {} <<'EOF'\n{}EOF",
            unit_dir,
            quote_path(&self.unit_path),
            unit
        )))
        .await?;
        ctx.exec(&CommandSpec::new("systemctl").arg("daemon-reload"))
            .await?;
        // the watcher outlives this step
        ctx.exec(&CommandSpec::new("systemctl").arg("enable").arg(self.unit_name()))
            .await?;
        ctx.exec(
            &CommandSpec::new("systemctl")
                .args(["start", "--no-block"])
                .arg(self.unit_name()),
        )
        .await?;
        Ok(())
    }
}

/// Mounts the shared network filesystem and hands it to the desktop user
#[derive(Debug, Clone)]
pub struct EfsMountAction {
    filesystem: SharedFilesystem,
    user: String,
}

impl EfsMountAction {
    pub fn new(filesystem: SharedFilesystem, user: &str) -> Self {
        Self {
            filesystem,
            user: user.to_string(),
        }
    }

    /// The fstab line for this filesystem
    pub fn fstab_entry(&self) -> String {
        format!(
            "{}:/ {} efs _netdev,tls 0 0",
            self.filesystem.file_system_id,
            self.filesystem.mount_point.display()
        )
    }
}

#[async_trait]
impl StepAction for EfsMountAction {
    async fn run(&self, ctx: &ActionContext<'_>) -> Result<()> {
        ctx.info("Configuring fstab and mounting")?;

        let mount_point = quote_path(&self.filesystem.mount_point);
        let prefix = quote(&format!("{}:/ ", self.filesystem.file_system_id));
        ctx.exec(&CommandSpec::shell(format!("mkdir -p {}", mount_point)))
            .await?;
        ctx.exec(&CommandSpec::shell(format!(
            "grep -qF {} /etc/fstab || echo {} >> /etc/fstab",
            prefix,
            quote(&self.fstab_entry())
        )))
        .await?;
        ctx.exec_transient(&CommandSpec::new("mount").arg("-a")).await?;
        ctx.exec(&CommandSpec::shell(format!(
            "chown {user}:{user} {}",
            mount_point,
            user = quote(&self.user)
        )))
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_pipeline_order_and_policies() {
        let orchestrator = standard_pipeline(&BootstrapConfig::default()).unwrap();
        let names = orchestrator.step_names();
        assert_eq!(names.len(), 17);
        assert_eq!(names.first(), Some(&"system-update"));
        assert_eq!(names.last(), Some(&"browser"));

        for (step, (name, policy)) in orchestrator.steps().iter().zip(STANDARD_STEPS) {
            assert_eq!(step.name, name);
            assert_eq!(step.policy, policy);
        }

        let critical = orchestrator
            .steps()
            .iter()
            .filter(|s| s.policy == StepPolicy::Critical)
            .count();
        assert_eq!(critical, 9);
    }

    #[test]
    fn test_efs_step_only_when_configured() {
        let mut config = BootstrapConfig::default();
        config.shared_filesystem = Some(SharedFilesystem {
            file_system_id: "fs-0abc".to_string(),
            mount_point: PathBuf::from("/mnt/efs"),
        });
        let orchestrator = standard_pipeline(&config).unwrap();
        assert_eq!(orchestrator.step_names().last(), Some(&EFS_MOUNT_STEP));
        assert_eq!(orchestrator.policy_of(EFS_MOUNT_STEP), Some(StepPolicy::Optional));
    }

    #[test]
    fn test_fstab_entry() {
        let action = EfsMountAction::new(
            SharedFilesystem {
                file_system_id: "fs-0123456789abcdef0".to_string(),
                mount_point: PathBuf::from("/mnt/efs"),
            },
            "ubuntu",
        );
        assert_eq!(
            action.fstab_entry(),
            "fs-0123456789abcdef0:/ /mnt/efs efs _netdev,tls 0 0"
        );
    }

    #[test]
    fn test_watcher_unit_contents() {
        let unit = watcher_unit(
            Path::new("/usr/local/bin/firstboot"),
            Some(Path::new("/etc/firstboot/config.toml")),
            "dcvserver",
        );
        assert!(unit.contains("After=dcvserver.service"));
        assert!(unit
            .contains("ExecStart=/usr/local/bin/firstboot watch --config /etc/firstboot/config.toml"));
        assert!(unit.contains("WantedBy=multi-user.target"));
        assert!(unit.contains("Type=simple\n"));
        assert!(unit.contains("Restart=on-failure\n"));
        assert!(!unit.contains("oneshot"));
        assert!(!unit.contains("RemainAfterExit"));

        let unit = watcher_unit(Path::new("/opt/first boot/fb"), None, "dcvserver");
        assert!(unit.contains("ExecStart='/opt/first boot/fb' watch\n"));
    }

    #[test]
    fn test_dcv_conf_uses_session_owner() {
        let mut config = BootstrapConfig::default();
        config.watcher.owner = Some("operator".to_string());
        let conf = dcv_conf(&config);
        assert!(conf.contains("owner=\"operator\""));
        assert!(conf.contains("web-port=8443"));
    }

    #[test]
    fn test_password_step_is_added_only_with_password() {
        let config = BootstrapConfig::default();
        assert_eq!(shell_step("system-update", &config).unwrap().commands().len(), 2);

        let config = BootstrapConfig {
            password: Some("dcv123456789012".to_string()),
            ..BootstrapConfig::default()
        };
        let action = shell_step("system-update", &config).unwrap();
        assert_eq!(action.commands().len(), 3);
        assert!(action.commands()[2].spec.to_string().contains("chpasswd"));
    }

    #[test]
    fn test_dcv_steps_use_configured_service() {
        let mut config = BootstrapConfig::default();
        config.watcher.service = "dcvserver-custom".to_string();

        let lines = |name: &str| -> Vec<String> {
            shell_step(name, &config)
                .unwrap()
                .commands()
                .iter()
                .map(|c| c.spec.to_string())
                .collect()
        };
        let server = lines("dcv-server");
        assert!(server
            .last()
            .unwrap()
            .contains("systemctl enable --now dcvserver-custom"));
        let conf = lines("dcv-config");
        assert!(conf.last().unwrap().contains("systemctl restart dcvserver-custom"));
    }
}
