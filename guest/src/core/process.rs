//! Translation of request-level process parameters into an OCI process
//! document.

use std::collections::HashSet;

use cocoon_shared::protocol::ProcessParameters;
use cocoon_shared::{CocoonError, CocoonResult};
use oci_spec::runtime::{
    Capability, LinuxCapabilities, LinuxCapabilitiesBuilder, PosixRlimitBuilder, PosixRlimitType,
    Process as OciProcess, ProcessBuilder, UserBuilder,
};

/// Capabilities granted to every process the supervisor creates, in all
/// five capability classes.
const CAPABILITIES: [Capability; 11] = [
    Capability::AuditWrite,
    Capability::Kill,
    Capability::NetBindService,
    Capability::SysAdmin,
    Capability::NetAdmin,
    Capability::Setgid,
    Capability::Setuid,
    Capability::Chown,
    Capability::Fowner,
    Capability::DacOverride,
    Capability::NetRaw,
];

const RLIMIT_NOFILE: u64 = 1024;

/// Convert process parameters to an OCI process document.
///
/// The argument vector is used verbatim when present; otherwise the command
/// line is tokenized with shell-style word splitting. Environment entry
/// order in the output is unspecified.
pub fn process_parameters_to_oci(params: &ProcessParameters) -> CocoonResult<OciProcess> {
    let args = if params.command_args.is_empty() {
        shell_words::split(&params.command_line).map_err(|e| {
            CocoonError::InvalidArguments(format!(
                "failed to parse command line '{}': {e}",
                params.command_line
            ))
        })?
    } else {
        params.command_args.clone()
    };

    let mut env: Vec<String> = params
        .environment
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect();
    env.sort();

    let user = UserBuilder::default()
        .uid(0u32)
        .gid(0u32)
        .build()
        .map_err(|e| CocoonError::InvalidArguments(format!("failed to build user: {e}")))?;

    let rlimits = vec![PosixRlimitBuilder::default()
        .typ(PosixRlimitType::RlimitNofile)
        .hard(RLIMIT_NOFILE)
        .soft(RLIMIT_NOFILE)
        .build()
        .map_err(|e| CocoonError::InvalidArguments(format!("failed to build rlimit: {e}")))?];

    ProcessBuilder::default()
        .terminal(params.emulate_console)
        .user(user)
        .args(args)
        .env(env)
        .cwd(params.working_directory.clone())
        .capabilities(default_capabilities()?)
        .rlimits(rlimits)
        .no_new_privileges(true)
        .build()
        .map_err(|e| CocoonError::InvalidArguments(format!("failed to build process: {e}")))
}

fn default_capabilities() -> CocoonResult<LinuxCapabilities> {
    let caps: HashSet<Capability> = CAPABILITIES.into_iter().collect();
    LinuxCapabilitiesBuilder::default()
        .bounding(caps.clone())
        .effective(caps.clone())
        .inheritable(caps.clone())
        .permitted(caps.clone())
        .ambient(caps)
        .build()
        .map_err(|e| CocoonError::InvalidArguments(format!("failed to build capabilities: {e}")))
}
