use kube::CustomResourceExt;

use kangal_operator::loadtest::LoadTest;

fn main() {
    print!("{}", serde_yaml::to_string(&LoadTest::crd()).unwrap());
}
