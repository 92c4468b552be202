use std::io::Cursor;

use asg_snapshot::{ReadBeExt, WriteBeExt};
use proptest::prelude::*;

proptest! {
    #[test]
    fn string_reader_never_panics(data in proptest::collection::vec(any::<u8>(), 0..256)) {
        let _ = Cursor::new(&data).read_string();
    }

    #[test]
    fn mixed_record_reads_back(a in any::<u32>(), b in any::<u64>(), name in "[a-z]{0,16}", flag in any::<bool>()) {
        let mut out = Vec::new();
        out.write_be32(a).unwrap();
        out.write_be64(b).unwrap();
        out.write_flag(flag).unwrap();
        out.write_string(&name).unwrap();

        let mut r = Cursor::new(out);
        prop_assert_eq!(r.read_be32().unwrap(), a);
        prop_assert_eq!(r.read_be64().unwrap(), b);
        prop_assert_eq!(r.read_flag().unwrap(), flag);
        prop_assert_eq!(r.read_string().unwrap(), name);
    }
}
