use kube::CustomResourceExt;
use node_detacher::crd::Attachment;

fn main() -> Result<(), serde_yaml::Error> {
    print!("{}", serde_yaml::to_string(&Attachment::crd())?);
    Ok(())
}
