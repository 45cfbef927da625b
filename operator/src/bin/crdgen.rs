//! Print the CustomResourceDefinitions for every agentmesh kind as a
//! multi-document YAML stream, ready for kubectl apply.

use agentmesh_operator::crds::{Agent, Route, Task, Tool};
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    for crd in [Agent::crd(), Tool::crd(), Route::crd(), Task::crd()] {
        println!("---");
        print!("{}", serde_yaml::to_string(&crd)?);
    }
    Ok(())
}
