use super::FlorenceTokenizer;
use std::io::Write;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

pub const ENCODE_PROMPT: &str = "Input text to encode!";
pub const BATCH_SEPARATOR: char = '|';

/// Reads lines until EOF. Each line is split on `|` and encoded as one
/// right padded batch. Returns the number of lines handled.
pub async fn encode_loop(
    tokenizer: &FlorenceTokenizer,
    input: impl AsyncBufRead + Unpin,
    mut output: impl Write,
) -> anyhow::Result<usize> {
    let mut lines = input.lines();
    let mut handled = 0;

    loop {
        writeln!(output, "{}", ENCODE_PROMPT)?;
        output.flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim_end_matches('\r');
        let sentences: Vec<&str> = line.split(BATCH_SEPARATOR).collect();

        let batch = tokenizer.encode_batch(&sentences)?;
        for (idx, sentence) in sentences.iter().enumerate() {
            let input_ids = batch.input_ids.row(idx).to_vec();
            let attention_mask = batch.attention_mask.row(idx).to_vec();
            let ids: Vec<u32> = input_ids.iter().map(|id| *id as u32).collect();

            writeln!(output, "Sentence: {}", sentence)?;
            writeln!(output, "Input ids: {:?}", input_ids)?;
            writeln!(output, "Attention mask: {:?}", attention_mask)?;
            writeln!(output, "Decoded: {}", tokenizer.decode(&ids, true)?)?;
        }

        handled += 1;
    }

    Ok(handled)
}
