//! Prints the CustomResourceDefinitions as a multi-document YAML stream.

use crds::{Instance, NodeGroup};
use kube::CustomResourceExt;

fn main() -> Result<(), serde_yaml::Error> {
    let docs = [
        serde_yaml::to_string(&NodeGroup::crd())?,
        serde_yaml::to_string(&Instance::crd())?,
    ];
    for doc in docs {
        println!("---\n{doc}");
    }
    Ok(())
}
