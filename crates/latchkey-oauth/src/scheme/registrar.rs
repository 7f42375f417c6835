//! OS URI-scheme associations, one registrar per host platform.

use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::RegistrationError;

/// Flag the OS passes in front of the captured URI.
pub const DEFAULT_LAUNCH_FLAG: &str = "--oauth-callback";

/// A persisted association from a URI scheme to this executable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemeRegistration {
    /// Application identity, used to name handler entries and IPC endpoints.
    pub app_id: String,
    pub scheme_name: String,
    pub executable_path: PathBuf,
    pub launch_flag: String,
}

impl SchemeRegistration {
    pub fn new(
        app_id: impl Into<String>,
        scheme_name: impl Into<String>,
        executable_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            app_id: app_id.into(),
            scheme_name: scheme_name.into().to_ascii_lowercase(),
            executable_path: executable_path.into(),
            launch_flag: DEFAULT_LAUNCH_FLAG.to_string(),
        }
    }

    /// Registration pointing at the running binary.
    pub fn for_current_exe(
        app_id: impl Into<String>,
        scheme_name: impl Into<String>,
    ) -> std::io::Result<Self> {
        Ok(Self::new(app_id, scheme_name, std::env::current_exe()?))
    }

    pub fn with_launch_flag(mut self, flag: impl Into<String>) -> Self {
        self.launch_flag = flag.into();
        self
    }
}

/// Installs and checks scheme associations on one host platform.
pub trait SchemeRegistrar: Send + Sync + std::fmt::Debug {
    /// Whether the association exists and points at `executable_path`.
    fn is_registered(&self, registration: &SchemeRegistration) -> Result<bool, RegistrationError>;

    /// Create or overwrite the association.
    fn install(&self, registration: &SchemeRegistration) -> Result<(), RegistrationError>;

    /// Remove the association. Absent associations are not an error.
    fn uninstall(&self, registration: &SchemeRegistration) -> Result<(), RegistrationError>;
}

/// Verify the association, installing it only when missing or stale.
///
/// Returns `true` when an install was performed.
pub fn ensure_registered(
    registrar: &dyn SchemeRegistrar,
    registration: &SchemeRegistration,
) -> Result<bool, RegistrationError> {
    if registrar.is_registered(registration)? {
        tracing::debug!(scheme = %registration.scheme_name, "Scheme association already current");
        return Ok(false);
    }

    registrar.install(registration)?;
    tracing::info!(
        scheme = %registration.scheme_name,
        exe = %registration.executable_path.display(),
        "Installed scheme association"
    );
    Ok(true)
}

/// Registrar for the platform this binary was built for.
pub fn platform_registrar() -> Box<dyn SchemeRegistrar> {
    #[cfg(target_os = "windows")]
    {
        Box::new(RegistryRegistrar)
    }
    #[cfg(target_os = "macos")]
    {
        Box::new(LaunchServicesRegistrar)
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        Box::new(DesktopEntryRegistrar::new())
    }
}

fn io_error(e: std::io::Error) -> RegistrationError {
    if e.kind() == std::io::ErrorKind::PermissionDenied {
        RegistrationError::Permission(e.to_string())
    } else {
        RegistrationError::Io(e)
    }
}

/// Run a helper tool, returning stdout on success.
fn run_tool(program: &str, args: &[&str]) -> Result<String, RegistrationError> {
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| RegistrationError::Command {
            program: program.to_string(),
            message: e.to_string(),
        })?;

    if output.status.success() {
        return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
    }

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if stderr.to_ascii_lowercase().contains("access is denied")
        || stderr.to_ascii_lowercase().contains("permission denied")
    {
        return Err(RegistrationError::Permission(stderr));
    }
    Err(RegistrationError::Command {
        program: program.to_string(),
        message: format!("{} ({})", stderr, output.status),
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Linux / BSD: XDG desktop entry
// ─────────────────────────────────────────────────────────────────────────────

/// Writes an XDG desktop entry claiming `x-scheme-handler/<scheme>`.
#[derive(Debug, Clone)]
pub struct DesktopEntryRegistrar {
    applications_dir: PathBuf,
    set_default_handler: bool,
}

impl Default for DesktopEntryRegistrar {
    fn default() -> Self {
        Self::new()
    }
}

impl DesktopEntryRegistrar {
    /// Use `$XDG_DATA_HOME/applications` and make the entry the default handler.
    pub fn new() -> Self {
        let applications_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from(".local/share"))
            .join("applications");
        Self {
            applications_dir,
            set_default_handler: true,
        }
    }

    /// Write entries into `dir` without touching the mime defaults.
    pub fn with_applications_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            applications_dir: dir.into(),
            set_default_handler: false,
        }
    }

    fn entry_name(registration: &SchemeRegistration) -> String {
        format!("{}-{}.desktop", registration.app_id, registration.scheme_name)
    }

    pub fn entry_path(&self, registration: &SchemeRegistration) -> PathBuf {
        self.applications_dir.join(Self::entry_name(registration))
    }

    fn exec_line(registration: &SchemeRegistration) -> String {
        format!(
            "Exec={} {} %u",
            quote_exec_arg(&registration.executable_path.to_string_lossy()),
            registration.launch_flag
        )
    }

    fn mime_line(registration: &SchemeRegistration) -> String {
        format!("MimeType=x-scheme-handler/{};", registration.scheme_name)
    }

    fn render(registration: &SchemeRegistration) -> String {
        format!(
            "[Desktop Entry]\n\
             Type=Application\n\
             Name={}\n\
             {}\n\
             {}\n\
             NoDisplay=true\n\
             Terminal=false\n",
            registration.app_id,
            Self::exec_line(registration),
            Self::mime_line(registration),
        )
    }
}

/// Quote an argument for a desktop entry `Exec` key.
fn quote_exec_arg(arg: &str) -> String {
    let mut quoted = String::with_capacity(arg.len() + 2);
    quoted.push('"');
    for c in arg.chars() {
        if matches!(c, '"' | '`' | '$' | '\\') {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

impl SchemeRegistrar for DesktopEntryRegistrar {
    fn is_registered(&self, registration: &SchemeRegistration) -> Result<bool, RegistrationError> {
        let path = self.entry_path(registration);
        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(io_error(e)),
        };

        let exec = Self::exec_line(registration);
        let mime = Self::mime_line(registration);
        Ok(contents.lines().any(|l| l == exec) && contents.lines().any(|l| l == mime))
    }

    fn install(&self, registration: &SchemeRegistration) -> Result<(), RegistrationError> {
        std::fs::create_dir_all(&self.applications_dir).map_err(io_error)?;
        let path = self.entry_path(registration);
        std::fs::write(&path, Self::render(registration)).map_err(io_error)?;

        if self.set_default_handler {
            let mime = format!("x-scheme-handler/{}", registration.scheme_name);
            let entry = Self::entry_name(registration);
            run_tool("xdg-mime", &["default", &entry, &mime])?;
        }
        Ok(())
    }

    fn uninstall(&self, registration: &SchemeRegistration) -> Result<(), RegistrationError> {
        match std::fs::remove_file(self.entry_path(registration)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(e)),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Windows: HKCU\Software\Classes
// ─────────────────────────────────────────────────────────────────────────────

/// Per-user protocol handler under `HKCU\Software\Classes\<scheme>`.
#[derive(Debug, Clone, Default)]
pub struct RegistryRegistrar;

impl RegistryRegistrar {
    fn class_key(registration: &SchemeRegistration) -> String {
        format!(r"HKCU\Software\Classes\{}", registration.scheme_name)
    }

    fn command(registration: &SchemeRegistration) -> String {
        format!(
            "\"{}\" {} \"%1\"",
            registration.executable_path.display(),
            registration.launch_flag
        )
    }

    /// Whether the class key exists at all, whatever command it holds.
    fn class_exists(class_key: &str) -> Result<bool, RegistrationError> {
        match run_tool("reg", &["query", class_key]) {
            Ok(_) => Ok(true),
            Err(RegistrationError::Command { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

impl SchemeRegistrar for RegistryRegistrar {
    fn is_registered(&self, registration: &SchemeRegistration) -> Result<bool, RegistrationError> {
        let key = format!(r"{}\shell\open\command", Self::class_key(registration));
        match run_tool("reg", &["query", &key, "/ve"]) {
            Ok(stdout) => Ok(stdout.contains(&Self::command(registration))),
            // `reg query` exits non-zero when the key is absent.
            Err(RegistrationError::Command { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn install(&self, registration: &SchemeRegistration) -> Result<(), RegistrationError> {
        let class_key = Self::class_key(registration);
        let description = format!("URL:{} Protocol", registration.scheme_name);
        let command_key = format!(r"{}\shell\open\command", class_key);
        let command = Self::command(registration);

        run_tool("reg", &["add", &class_key, "/ve", "/d", &description, "/f"])?;
        run_tool("reg", &["add", &class_key, "/v", "URL Protocol", "/d", "", "/f"])?;
        run_tool("reg", &["add", &command_key, "/ve", "/d", &command, "/f"])?;
        Ok(())
    }

    fn uninstall(&self, registration: &SchemeRegistration) -> Result<(), RegistrationError> {
        let class_key = Self::class_key(registration);
        // A key pointing at another executable is still ours to remove.
        if !Self::class_exists(&class_key)? {
            return Ok(());
        }
        run_tool("reg", &["delete", &class_key, "/f"]).map(|_| ())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// macOS: Info.plist + LaunchServices
// ─────────────────────────────────────────────────────────────────────────────

const LSREGISTER: &str = "/System/Library/Frameworks/CoreServices.framework/Frameworks/\
LaunchServices.framework/Support/lsregister";

/// Schemes on macOS are declared in the bundle's `Info.plist`; this
/// registrar checks the declaration and refreshes LaunchServices.
#[derive(Debug, Clone, Default)]
pub struct LaunchServicesRegistrar;

impl LaunchServicesRegistrar {
    /// `Foo.app` for an executable at `Foo.app/Contents/MacOS/foo`.
    fn bundle_path(executable: &Path) -> Option<PathBuf> {
        let bundle = executable.parent()?.parent()?.parent()?;
        let is_app = bundle
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("app"));
        is_app.then(|| bundle.to_path_buf())
    }

    fn bundle(registration: &SchemeRegistration) -> Result<PathBuf, RegistrationError> {
        Self::bundle_path(&registration.executable_path).ok_or_else(|| {
            RegistrationError::Unsupported(format!(
                "{} is not inside an application bundle",
                registration.executable_path.display()
            ))
        })
    }

    fn declares_scheme(bundle: &Path, scheme: &str) -> Result<bool, RegistrationError> {
        let plist = bundle.join("Contents").join("Info.plist");
        let contents = match std::fs::read_to_string(&plist) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(io_error(e)),
        };
        Ok(contents.contains("CFBundleURLSchemes")
            && contents.contains(&format!("<string>{}</string>", scheme)))
    }
}

impl SchemeRegistrar for LaunchServicesRegistrar {
    fn is_registered(&self, registration: &SchemeRegistration) -> Result<bool, RegistrationError> {
        let bundle = Self::bundle(registration)?;
        Self::declares_scheme(&bundle, &registration.scheme_name)
    }

    fn install(&self, registration: &SchemeRegistration) -> Result<(), RegistrationError> {
        let bundle = Self::bundle(registration)?;
        if !Self::declares_scheme(&bundle, &registration.scheme_name)? {
            return Err(RegistrationError::Unsupported(format!(
                "scheme '{}' must be declared under CFBundleURLTypes in {}",
                registration.scheme_name,
                bundle.join("Contents/Info.plist").display()
            )));
        }
        run_tool(LSREGISTER, &["-f", &bundle.to_string_lossy()]).map(|_| ())
    }

    fn uninstall(&self, registration: &SchemeRegistration) -> Result<(), RegistrationError> {
        let bundle = Self::bundle(registration)?;
        run_tool(LSREGISTER, &["-u", &bundle.to_string_lossy()]).map(|_| ())
    }
}
