use std::io::BufRead;

use anyhow::Result;

/// One emitted chunk: words re-joined with single spaces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPiece {
    pub text: String,
    pub words: i64,
}

/// Streams whitespace-delimited words into fixed-size chunks.
///
/// A chunk is emitted once the accumulated word lengths plus the joining
/// spaces reach `chunk_size`, or at end of stream with a non-empty buffer.
/// The reader's byte position is tracked so text files can resume exactly
/// where a capped pass left off.
pub struct Chunker {
    chunk_size: usize,
}

impl Chunker {
    pub fn new(chunk_size: usize) -> Self {
        Self { chunk_size }
    }

    /// Reads words from `reader`, emitting at most `max_chunks` chunks when
    /// `max_chunks > 0`. Returns the stream position in bytes after the last
    /// consumed word, suitable for a later seek-and-resume.
    pub fn stream<R: BufRead>(
        &self,
        reader: R,
        max_chunks: usize,
        mut emit: impl FnMut(ChunkPiece) -> Result<()>,
    ) -> Result<u64> {
        let mut words = WordStream::new(reader);
        let mut buffer: Vec<String> = Vec::new();
        let mut char_count = 0usize;
        let mut chunks = 0usize;

        loop {
            let word = words.next_word()?;
            let at_end = word.is_none();
            if let Some(word) = word {
                char_count += word.chars().count();
                buffer.push(word);
            }

            let joined_len = char_count + buffer.len().saturating_sub(1);
            if (!buffer.is_empty() && joined_len >= self.chunk_size) || (at_end && !buffer.is_empty())
            {
                emit(ChunkPiece {
                    text: buffer.join(" "),
                    words: buffer.len() as i64,
                })?;
                buffer.clear();
                char_count = 0;
                chunks += 1;
                if max_chunks > 0 && chunks == max_chunks {
                    break;
                }
            }

            if at_end {
                break;
            }
        }

        Ok(words.position())
    }
}

/// Whitespace tokenizer over a buffered reader, counting consumed bytes.
///
/// Splitting happens on ASCII whitespace only, which never occurs inside a
/// multi-byte UTF-8 sequence, so positions always land on word boundaries.
struct WordStream<R: BufRead> {
    reader: R,
    position: u64,
}

impl<R: BufRead> WordStream<R> {
    fn new(reader: R) -> Self {
        Self {
            reader,
            position: 0,
        }
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn next_word(&mut self) -> std::io::Result<Option<String>> {
        let mut word: Vec<u8> = Vec::new();
        loop {
            let buf = self.reader.fill_buf()?;
            if buf.is_empty() {
                break;
            }

            let mut used = 0;
            let mut done = false;
            for &byte in buf {
                used += 1;
                if byte.is_ascii_whitespace() {
                    if word.is_empty() {
                        continue;
                    }
                    done = true;
                    break;
                }
                word.push(byte);
            }
            self.reader.consume(used);
            self.position += used as u64;
            if done {
                break;
            }
        }

        if word.is_empty() {
            Ok(None)
        } else {
            Ok(Some(String::from_utf8_lossy(&word).into_owned()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn collect(chunk_size: usize, max_chunks: usize, input: &str) -> (Vec<ChunkPiece>, u64) {
        let chunker = Chunker::new(chunk_size);
        let mut pieces = Vec::new();
        let pos = chunker
            .stream(Cursor::new(input.as_bytes()), max_chunks, |piece| {
                pieces.push(piece);
                Ok(())
            })
            .unwrap();
        (pieces, pos)
    }

    #[test]
    fn splits_on_chunk_size() {
        let (pieces, _) = collect(10, 0, "alpha beta gamma delta");
        let texts: Vec<&str> = pieces.iter().map(|p| p.text.as_str()).collect();
        assert_eq!(texts, vec!["alpha beta", "gamma delta"]);
        assert_eq!(pieces[0].words, 2);
        assert_eq!(pieces[1].words, 2);
    }

    #[test]
    fn emits_trailing_words_at_end_of_stream() {
        let (pieces, _) = collect(100, 0, "one two three");
        assert_eq!(pieces.len(), 1);
        assert_eq!(pieces[0].text, "one two three");
        assert_eq!(pieces[0].words, 3);
    }

    #[test]
    fn empty_input_emits_nothing() {
        let (pieces, pos) = collect(10, 0, "");
        assert!(pieces.is_empty());
        assert_eq!(pos, 0);

        let (pieces, _) = collect(10, 0, "   \n\t  ");
        assert!(pieces.is_empty());
    }

    #[test]
    fn collapses_repeated_whitespace() {
        let (pieces, _) = collect(100, 0, "a\n\n  b\t\tc");
        assert_eq!(pieces[0].text, "a b c");
    }

    #[test]
    fn max_chunks_caps_and_reports_resume_position() {
        let input = "alpha beta gamma delta";
        let (pieces, pos) = collect(10, 1, input);
        assert_eq!(pieces.len(), 1);
        assert_eq!(pieces[0].text, "alpha beta");

        // Resuming from the reported position yields the rest.
        let mut rest = Cursor::new(input.as_bytes());
        rest.set_position(pos);
        let chunker = Chunker::new(10);
        let mut tail = Vec::new();
        chunker
            .stream(rest, 0, |piece| {
                tail.push(piece.text);
                Ok(())
            })
            .unwrap();
        assert_eq!(tail, vec!["gamma delta"]);
    }

    #[test]
    fn long_word_forms_its_own_chunk() {
        let (pieces, _) = collect(5, 0, "supercalifragilistic tiny");
        assert_eq!(pieces.len(), 2);
        assert_eq!(pieces[0].text, "supercalifragilistic");
        assert_eq!(pieces[1].text, "tiny");
    }

    #[test]
    fn counts_multibyte_characters_not_bytes() {
        // Four two-byte characters per word; chunk_size counts characters.
        let (pieces, _) = collect(9, 0, "éééé ùùùù zzzz");
        assert_eq!(pieces[0].text, "éééé ùùùù");
        assert_eq!(pieces[1].text, "zzzz");
    }
}
