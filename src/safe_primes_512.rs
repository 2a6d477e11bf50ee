// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! Pre-generated 512-bit safe primes, so tests do not spend minutes searching
//! for them. Never use these for real key material.

use lazy_static::lazy_static;
use libpaillier::unknown_order::BigNumber;

lazy_static! {
    pub(crate) static ref POOL_OF_PRIMES: Vec<BigNumber> = [
        "cdbdecb14f7f4122c2dd759c2f15818521d7e4bc6ab68ce108894a96030076248a2cf7e16b0367c7f86869e8c5138c042670e7cceaa0bb9fae65ed471af3d997",
        "c78df7577f8de4490ef169149d5f1ac97947ba2e208c60b91783e35dfeff4a26e2415d48ad7d5c2b16f007fa7ce628d77687850effc772a814b416f280ddd17b",
        "eef9964dad00a6c53d22af795d9e55dbc9ff4b8e91ffe1a2866f4fd002297b0bd939cd85523779cc1c0405eb670ed3b27c8f7c6587898f189ea93f82a51f6403",
        "985cc1063480e44e8229cddf510daac71099b6f366d378b37f659813a23da741672c4a14772cc8c23f40be10f6907dfec28502012ac8954696f08bdd42cc1357",
        "f61ade8595bb397e2fe2d8d76e65345e3bf79653048d6c9e920e86d5a4e53188bc17fb83d65e53a8213afae2afd60420a2fd7cad61f1681f5b59f8b60ae9afa3",
        "8896122f8c36f7cacc6588cef4f2c9a8c1ce696a05721c771e693bc6c432822ca1a6fecdcfafa48279f643ee82d020374b5830c82397f74ff62d5a0450622a0b",
        "b2eda82b3e835dc1092138e5508191aa09da58c1ee7381d3cfe318a020eee4863775e1606ea4174166771e322d28ed628995300d0c6e704dcf0e60222cb4d207",
        "d812c6b192fdf58908d27ca73f068bc5e72733bcab388569cd88473c179a0a1f04ebb20af38706382b5cfff1f8d49eb743fd9360cd6a98b7108f9e9e3004904b",
    ]
    .iter()
    .filter_map(|prime| hex::decode(prime).ok())
    .map(|bytes| BigNumber::from_slice(bytes.as_slice()))
    .collect();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::bit_length;
    use test_log::test;

    #[test]
    fn pooled_primes_are_safe_primes() {
        assert_eq!(POOL_OF_PRIMES.len(), 8);
        let one = BigNumber::one();
        let two = BigNumber::from(2u64);
        for p in POOL_OF_PRIMES.iter() {
            assert_eq!(bit_length(p), 512);
            assert!(p.is_prime());
            assert!(((p - &one) / &two).is_prime());
        }
    }
}
