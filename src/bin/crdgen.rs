use kube::CustomResourceExt;

fn main() {
    print!(
        "{}",
        serde_yaml::to_string(&cfapi_operator::resources::cfapis::CFAPI::crd()).unwrap()
    )
}
