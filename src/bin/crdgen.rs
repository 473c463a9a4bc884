use kube::CustomResourceExt;

use cluster_import_operator::resources::{managedclusteraddons, managedclusters, manifestworks};

fn main() {
    let crds = [
        serde_yaml::to_string(&managedclusters::ManagedCluster::crd()),
        serde_yaml::to_string(&manifestworks::ManifestWork::crd()),
        serde_yaml::to_string(&managedclusteraddons::ManagedClusterAddOn::crd()),
    ];
    let rendered: Vec<String> = crds
        .into_iter()
        .map(|crd| crd.expect("CRD schemas to serialize"))
        .collect();
    print!("{}", rendered.join("---\n"))
}
