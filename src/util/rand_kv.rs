use bytes::Bytes;
use rand::Rng;

#[allow(dead_code)]
pub fn get_test_key(i: usize) -> Bytes {
  Bytes::from(std::format!("haven-kv-key-{:09}", i))
}

#[allow(dead_code)]
pub fn get_test_value(i: usize) -> Bytes {
  let mut rng = rand::rng();
  let suffix: String = (0..24)
    .map(|_| rng.sample(rand::distr::Alphanumeric) as char)
    .collect();
  Bytes::from(std::format!("haven-kv-value-{:09}-{}", i, suffix))
}
