// Match finding shared by the BPS delta builder and the VCDIFF builder.
//
// - `table`: arena hash chains keyed by 16-bit symbols
// - `matching`: longest-match lookups and the greedy operation scan

pub mod matching;
pub mod table;
