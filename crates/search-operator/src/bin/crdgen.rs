use kube::core::CustomResourceExt;
use search_operator::crds::search::Search;

fn main() -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(&Search::crd())?);
    Ok(())
}
