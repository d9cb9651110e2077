//! Utilities used in this crate.
//!
//! This is not part of the public interface of the crate.

/// Print a hexdump of `buf`, labelling each row with its offset counted from `base`.
pub fn hexdump(base: usize, buf: &[u8]) -> String {
    let step = 32;
    let lines: Vec<String> = buf
        .chunks(step)
        .enumerate()
        .map(|(row, chunk)| {
            let bytes: Vec<String> = chunk.iter().map(|x| format!("{:02X}", x)).collect();
            format!("{:#08x}\t\t{}", base + row * step, bytes.join(" "))
        })
        .collect();
    lines.join("\n")
}
