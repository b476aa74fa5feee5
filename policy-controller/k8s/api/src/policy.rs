pub mod cilium;
pub mod kubearmor;

pub use self::{
    cilium::{CiliumNetworkPolicy, CiliumNetworkPolicySpec},
    kubearmor::{KubeArmorPolicy, KubeArmorPolicySpec},
};

/// The API version of a namespaced resource type, e.g. `cilium.io/v2`.
pub fn api_version<T>() -> String
where
    T: kube::Resource<DynamicType = ()>,
{
    T::api_version(&()).into_owned()
}

/// The kind of a resource type, e.g. `CiliumNetworkPolicy`.
pub fn kind<T>() -> String
where
    T: kube::Resource<DynamicType = ()>,
{
    T::kind(&()).into_owned()
}
