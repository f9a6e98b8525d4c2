use std::fmt::{self, Display};
use std::hash::{self, Hash};

/// A basic description of a Kubernetes resource, with just enough information to talk to the api
/// server about it. We use `&'static str` for all of these so that it's easy to pass references
/// around without copying. Only the kinds that are mirrored into the database, or fetched while
/// mirroring them, are defined here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct K8sType {
    pub api_version: &'static str,
    pub kind: &'static str,
    pub plural_kind: &'static str,
}

impl Hash for K8sType {
    fn hash<H: hash::Hasher>(&self, hasher: &mut H) {
        self.api_version.hash(hasher);
        self.kind.hash(hasher);
    }
}

impl K8sType {
    pub fn as_group_and_version(&self) -> (&str, &str) {
        match self.api_version.find('/') {
            Some(slash_idx) => (
                &self.api_version[..slash_idx],
                &self.api_version[(slash_idx + 1)..],
            ),
            None => ("", self.api_version),
        }
    }

    pub fn group(&self) -> &str {
        self.as_group_and_version().0
    }

    pub fn version(&self) -> &str {
        self.as_group_and_version().1
    }
}

impl Display for K8sType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.api_version, self.plural_kind)
    }
}

macro_rules! k8s_type {
    ($ref_name:ident, $api_version:expr, $kind:expr, $plural_kind:expr) => {
        #[allow(non_upper_case_globals)]
        pub static $ref_name: &crate::k8s_types::K8sType = &crate::k8s_types::K8sType {
            api_version: $api_version,
            kind: $kind,
            plural_kind: $plural_kind,
        };
    };
}

macro_rules! def_types {
    (@nogroupmod, $group:expr, [
        $( $version:ident => [
            $( $kind:ident ~ $plural_kind:ident ),*
        ]),*
    ]) => {
        $(
            pub mod $version {
                $(
                    k8s_type!($kind, concat!($group, "/", stringify!($version)), stringify!($kind), stringify!($plural_kind));
                )*
            }
        )*
    };
    (@core => [
        $( $version:ident => [
            $( $kind:ident ~ $plural_kind:ident ),*
        ]),*
    ]) => {
        pub mod core {
            $(pub mod $version {
                $(
                    k8s_type!($kind, stringify!($version), stringify!($kind), stringify!($plural_kind));
                )*
            })*
        }
    }
}

def_types! {
    @core => [
        v1 => [
            Pod ~ pods,
            PersistentVolumeClaim ~ persistentvolumeclaims
        ]
    ]
}

pub mod metrics_k8s_io {
    def_types! {
        @nogroupmod, "metrics.k8s.io", [
            v1beta1 => [
                PodMetrics ~ pods
            ]
        ]
    }
}
