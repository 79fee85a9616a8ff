use std::{collections::BTreeMap, fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::{BuildError, Result};

/// The manifest format Podman uses when none is requested
pub const DEFAULT_OUTPUT_FORMAT: &str = "application/vnd.oci.image.manifest.v1+json";

/// Every option of a build that is not the context itself.
///
/// Mostly follows the query parameters of the libpod `/build` endpoint,
/// renamed where the daemon's names are terse. Unset (`None` or empty) options
/// are not sent at all. This can be deserialized from JSON, in which case
/// unknown fields are ignored so that files written for newer daemons still
/// load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildOptions {
    /// A name and optional tag to apply to the image in the `name:tag` format.
    /// If you omit the tag the default `latest` value is assumed.
    pub tag: Option<String>,
    /// Target build stage in a multi-stage build file
    pub target: Option<String>,
    /// Platform in the format `os[/arch[/variant]]`
    pub platform: Option<String>,
    /// Suppress verbose build output.
    pub quiet: Option<bool>,
    /// Do not use the cache when building the image.
    pub nocache: Option<bool>,
    /// Attempt to pull the image even if an older image exists locally.
    pub pull: Option<bool>,
    /// Remove intermediate containers after a successful build.
    pub rm: Option<bool>,
    /// Always remove intermediate containers, even upon failure.
    pub forcerm: Option<bool>,
    /// Squash the resulting images layers into a single layer.
    pub squash: Option<bool>,
    /// Sets the networking mode for the run commands during build. Supported
    /// standard values are: `bridge`, `host`, `none`, and
    /// `container:<name|id>`. Any other value is taken as a custom network's
    /// name to which this container should connect to.
    pub network_mode: Option<String>,
    /// Size of `/dev/shm` in bytes. The size must be greater than 0. If
    /// omitted the system uses 64MB.
    pub shmsize: Option<u64>,
    /// Inject http proxy environment variables into the build containers
    pub http_proxy: Option<bool>,
    /// Cache intermediate layers during the build, `true` by default
    pub layers: Option<bool>,
    /// Custom build output selection
    pub output: Option<String>,
    /// The format of the output image's manifest and configuration data
    pub output_format: Option<String>,
    /// Name of the build file within the context. For a loose build file this
    /// is the name it is staged under, for a directory it is looked up
    /// relative to the directory.
    pub dockerfile: Option<String>,
    /// Build-time variables, used as the environment for `RUN` instructions
    /// and for variable expansion in other instructions.
    pub buildargs: BTreeMap<String, String>,
    /// Images used for build cache resolution.
    pub cache_from: Vec<String>,
    /// Extra hosts to add to `/etc/hosts`, hostname to IP address.
    pub extra_hosts: BTreeMap<String, String>,
    /// Arbitrary key/value labels to set on the image.
    pub labels: BTreeMap<String, String>,
    /// Limits applied to each container created by the build process
    pub container_limits: Option<ResourceLimits>,
    /// Host directories mounted into containers when executing `RUN`
    /// instructions, keyed by host path
    pub volumes: BTreeMap<String, VolumeMount>,
    /// End-to-end HTTP timeout in seconds
    pub timeout: Option<u64>,
    /// Compress locally built archives with gzip
    pub gzip: bool,
    /// Custom stream encoding, not supported together with `gzip`
    pub encoding: Option<String>,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            tag: None,
            target: None,
            platform: None,
            quiet: None,
            nocache: None,
            pull: None,
            rm: None,
            forcerm: None,
            squash: None,
            network_mode: None,
            shmsize: None,
            http_proxy: None,
            layers: Some(true),
            output: None,
            output_format: Some(DEFAULT_OUTPUT_FORMAT.to_owned()),
            dockerfile: None,
            buildargs: BTreeMap::new(),
            cache_from: Vec::new(),
            extra_hosts: BTreeMap::new(),
            labels: BTreeMap::new(),
            container_limits: None,
            volumes: BTreeMap::new(),
            timeout: None,
            gzip: false,
            encoding: None,
        }
    }
}

/// Limits for the containers the daemon runs during a build. Every field is
/// flattened into its own query parameter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Set memory limit for build.
    pub memory: Option<u64>,
    /// Total memory (memory + swap). Set as `-1` to disable swap.
    pub memswap: Option<i64>,
    /// CPU shares (relative weight).
    pub cpushares: Option<u64>,
    /// The length of a CPU period in microseconds.
    pub cpuperiod: Option<u64>,
    /// Microseconds of CPU time that the container can get in a CPU period.
    pub cpuquota: Option<u64>,
    /// CPUs in which to allow execution (e.g., `0-3`, `0,1`).
    pub cpusetcpus: Option<String>,
}

/// Where a host directory is mounted for `RUN` instructions and how.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeMount {
    pub bind: Option<String>,
    pub mode: Option<VolumeMode>,
}

/// `mode` as written by the caller. Only [VolumeMode::Flags] is accepted, a
/// single scalar is rejected when marshaling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VolumeMode {
    Flags(Vec<String>),
    Single(String),
}

/// The vocabulary of volume mode flags the daemon understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VolumeFlag {
    ReadOnly,
    ReadWrite,
    /// `z`, shared SELinux relabel
    Relabel,
    /// `Z`, private SELinux relabel
    RelabelPrivate,
    /// `O`, overlay mount
    Overlay,
    /// `U`, chown the source to the container user namespace
    Chown,
    Shared,
    RShared,
    Slave,
    RSlave,
    Private,
    RPrivate,
}

impl VolumeFlag {
    pub fn as_str(self) -> &'static str {
        match self {
            VolumeFlag::ReadOnly => "ro",
            VolumeFlag::ReadWrite => "rw",
            VolumeFlag::Relabel => "z",
            VolumeFlag::RelabelPrivate => "Z",
            VolumeFlag::Overlay => "O",
            VolumeFlag::Chown => "U",
            VolumeFlag::Shared => "shared",
            VolumeFlag::RShared => "rshared",
            VolumeFlag::Slave => "slave",
            VolumeFlag::RSlave => "rslave",
            VolumeFlag::Private => "private",
            VolumeFlag::RPrivate => "rprivate",
        }
    }
}

impl fmt::Display for VolumeFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VolumeFlag {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "ro" => VolumeFlag::ReadOnly,
            "rw" => VolumeFlag::ReadWrite,
            "z" => VolumeFlag::Relabel,
            "Z" => VolumeFlag::RelabelPrivate,
            "O" => VolumeFlag::Overlay,
            "U" => VolumeFlag::Chown,
            "shared" => VolumeFlag::Shared,
            "rshared" => VolumeFlag::RShared,
            "slave" => VolumeFlag::Slave,
            "rslave" => VolumeFlag::RSlave,
            "private" => VolumeFlag::Private,
            "rprivate" => VolumeFlag::RPrivate,
            _ => return Err(format!("unknown volume mode flag \"{s}\"")),
        })
    }
}

impl VolumeMount {
    /// A read-write mount at `bind` with no extra flags
    pub fn new(bind: impl Into<String>) -> Self {
        Self {
            bind: Some(bind.into()),
            mode: None,
        }
    }

    pub fn with_flags(mut self, flags: impl IntoIterator<Item = VolumeFlag>) -> Self {
        self.mode = Some(VolumeMode::Flags(
            flags.into_iter().map(|f| f.as_str().to_owned()).collect(),
        ));
        self
    }

    /// Formats as `host_path:bind_path:flag,flag`. The flag segment is left
    /// empty (but present) when there are no flags.
    pub fn to_param(&self, host_path: &str) -> Result<String> {
        let bind = self.bind.as_ref().ok_or_else(|| {
            BuildError::config(format!("volume {host_path} 'bind' value not defined"))
        })?;
        let flags: &[String] = match &self.mode {
            None => &[],
            Some(VolumeMode::Flags(flags)) => flags,
            Some(VolumeMode::Single(_)) => {
                return Err(BuildError::config(format!(
                    "volume {host_path} 'mode' value should be a list"
                )))
            }
        };
        for flag in flags {
            VolumeFlag::from_str(flag)
                .map_err(|e| BuildError::config(format!("volume {host_path}: {e}")))?;
        }
        Ok(format!("{host_path}:{bind}:{}", flags.join(",")))
    }
}

/// Flat, ordered query parameters. Keys may repeat (`volume`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildParams(Vec<(String, String)>);

impl BuildParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a parameter, keeping any earlier ones with the same key
    pub fn push(&mut self, key: impl Into<String>, val: impl Into<String>) {
        self.0.push((key.into(), val.into()));
    }

    /// Replaces every parameter named `key` with a single value
    pub fn set(&mut self, key: &str, val: impl Into<String>) {
        self.0.retain(|(k, _)| k != key);
        self.push(key, val);
    }

    fn push_opt(&mut self, key: &str, val: Option<impl ToString>) {
        if let Some(val) = val {
            self.push(key, val.to_string());
        }
    }

    fn push_json<T: Serialize + ?Sized>(&mut self, key: &str, val: &T) -> Result<()> {
        let s = serde_json::to_string(val)
            .map_err(|e| BuildError::config(format!("could not encode `{key}`: {e}")))?;
        self.push(key, s);
        Ok(())
    }

    /// The first value for `key`
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.0
            .iter()
            .filter(move |(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_pairs(&self) -> &[(String, String)] {
        &self.0
    }
}

impl BuildOptions {
    /// Maps the options to the daemon's query parameters.
    ///
    /// This is pure, the same options always give the same parameters in the
    /// same order. Malformed volumes and conflicting encodings are reported as
    /// [BuildError::Config].
    pub fn to_query_params(&self) -> Result<BuildParams> {
        if self.gzip && self.encoding.is_some() {
            return Err(BuildError::config(
                "custom encoding not supported when gzip enabled",
            ));
        }

        let mut params = BuildParams::new();
        params.push_opt("dockerfile", self.dockerfile.as_ref());
        params.push_opt("forcerm", self.forcerm);
        params.push_opt("httpproxy", self.http_proxy);
        params.push_opt("networkmode", self.network_mode.as_ref());
        params.push_opt("nocache", self.nocache);
        params.push_opt("platform", self.platform.as_ref());
        params.push_opt("pull", self.pull);
        params.push_opt("q", self.quiet);
        params.push_opt("rm", self.rm);
        params.push_opt("shmsize", self.shmsize);
        params.push_opt("squash", self.squash);
        params.push_opt("t", self.tag.as_ref());
        params.push_opt("target", self.target.as_ref());
        params.push_opt("layers", self.layers);
        params.push_opt("output", self.output.as_ref());
        params.push_opt("outputformat", self.output_format.as_ref());

        if !self.buildargs.is_empty() {
            params.push_json("buildargs", &self.buildargs)?;
        }
        if !self.cache_from.is_empty() {
            params.push_json("cachefrom", &self.cache_from)?;
        }

        if let Some(limits) = &self.container_limits {
            params.push_opt("cpuperiod", limits.cpuperiod);
            params.push_opt("cpuquota", limits.cpuquota);
            params.push_opt("cpusetcpus", limits.cpusetcpus.as_ref());
            params.push_opt("cpushares", limits.cpushares);
            params.push_opt("memory", limits.memory);
            params.push_opt("memswap", limits.memswap);
        }

        if !self.extra_hosts.is_empty() {
            params.push_json("extrahosts", &self.extra_hosts)?;
        }
        if !self.labels.is_empty() {
            params.push_json("labels", &self.labels)?;
        }

        for (host_path, mount) in &self.volumes {
            params.push("volume", mount.to_param(host_path)?);
        }

        Ok(params)
    }

    pub fn timeout(&self) -> Option<std::time::Duration> {
        self.timeout.map(std::time::Duration::from_secs)
    }
}
