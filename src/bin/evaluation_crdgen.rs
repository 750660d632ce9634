use kube::CustomResourceExt;

fn main() {
    print!(
        "{}",
        serde_yaml::to_string(
            &node_readiness_controller::resources::nodereadinessevaluations::NodeReadinessEvaluation::crd()
        )
        .unwrap()
    )
}
