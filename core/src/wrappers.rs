// core/src/wrappers.rs
//
// Models that delegate to another model: one swapped at run time by state
// changes, and one that scores multiword tokens through their components.

use std::cell::RefCell;

use crate::error::Result;
use crate::lm::{LanguageModel, LmHandle};
use crate::prob::{LogP, LOGP_ONE};
use crate::vocab::{Vocab, VocabIndex};

pub type ModelLoader<'a> = Box<dyn Fn(&str) -> Result<Box<dyn LanguageModel + 'a>> + 'a>;

/// A model replaced whenever the state changes; the state string names
/// the model to load. Until the first successful load every word has
/// probability one.
pub struct DynamicLm<'a> {
    vocab: Vocab,
    loader: ModelLoader<'a>,
    current: RefCell<Option<(String, Box<dyn LanguageModel + 'a>)>>,
}

impl<'a> DynamicLm<'a> {
    pub fn new(vocab: Vocab, loader: ModelLoader<'a>) -> Self {
        Self {
            vocab,
            loader,
            current: RefCell::new(None),
        }
    }

    pub fn state(&self) -> Option<String> {
        self.current.borrow().as_ref().map(|(s, _)| s.clone())
    }
}

impl LanguageModel for DynamicLm<'_> {
    fn vocab(&self) -> &Vocab {
        &self.vocab
    }

    fn word_prob(&self, word: VocabIndex, context: &[VocabIndex]) -> LogP {
        match self.current.borrow().as_ref() {
            Some((_, lm)) => lm.word_prob(word, context),
            None => LOGP_ONE,
        }
    }

    fn order(&self) -> usize {
        self.current.borrow().as_ref().map_or(0, |(_, lm)| lm.order())
    }

    /// Loads the model named by `state`. A failed load keeps the previous
    /// model.
    fn set_state(&self, state: &str) -> bool {
        if self.current.borrow().as_ref().is_some_and(|(s, _)| s == state) {
            return true;
        }
        match (self.loader)(state) {
            Ok(lm) => {
                tracing::info!(state, "switched model");
                *self.current.borrow_mut() = Some((state.to_string(), lm));
                true
            }
            Err(e) => {
                tracing::error!(state, error = %e, "could not load model for state");
                false
            }
        }
    }
}

/// Scores multiword tokens (`new_york`) by chaining the component
/// probabilities of a model over single words. Histories are split the
/// same way.
pub struct MultiwordLm<'a> {
    lm: LmHandle<'a>,
    delimiter: char,
}

impl<'a> MultiwordLm<'a> {
    pub fn new(lm: LmHandle<'a>, delimiter: char) -> Self {
        Self { lm, delimiter }
    }

    /// Context expanded into components, most recent first.
    fn expand_context(&self, context: &[VocabIndex]) -> Vec<VocabIndex> {
        let vocab = self.lm.vocab();
        let limit = match self.lm.order() {
            0 => usize::MAX,
            n => n - 1,
        };
        let mut out = Vec::with_capacity(context.len());
        for &w in context {
            out.extend(vocab.split_multiword(w, self.delimiter).into_iter().rev());
            if out.len() >= limit {
                out.truncate(limit);
                break;
            }
        }
        out
    }
}

impl LanguageModel for MultiwordLm<'_> {
    fn vocab(&self) -> &Vocab {
        self.lm.vocab()
    }

    fn word_prob(&self, word: VocabIndex, context: &[VocabIndex]) -> LogP {
        let parts = self.lm.vocab().split_multiword(word, self.delimiter);
        let mut history = self.expand_context(context);
        let mut total = LOGP_ONE;
        for part in parts {
            total += self.lm.word_prob(part, &history);
            history.insert(0, part);
        }
        total
    }

    fn is_non_word(&self, word: VocabIndex) -> bool {
        self.lm.is_non_word(word)
    }

    fn set_state(&self, state: &str) -> bool {
        self.lm.set_state(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LmError;
    use crate::lm::NullLm;
    use crate::prob::{log_of, LOGP_ZERO};

    /// p(w | h) = 1/2 when w follows its predecessor alphabetically, else 1/4.
    struct Ordered {
        vocab: Vocab,
    }

    impl LanguageModel for Ordered {
        fn vocab(&self) -> &Vocab {
            &self.vocab
        }

        fn word_prob(&self, word: VocabIndex, context: &[VocabIndex]) -> LogP {
            match context.first() {
                Some(&prev) if self.vocab.compare(prev, word).is_lt() => log_of(0.5),
                _ => log_of(0.25),
            }
        }

        fn order(&self) -> usize {
            2
        }
    }

    #[test]
    fn multiwords_chain_components() {
        let vocab = Vocab::new();
        let ab = vocab.add_word("a_b");
        let c = vocab.add_word("c");
        let inner = Ordered { vocab: vocab.clone() };
        let lm = MultiwordLm::new(LmHandle::owned(inner), '_');
        // p(a) * p(b | a)
        assert!((lm.word_prob(ab, &[]) - log_of(0.25 * 0.5)).abs() < 1e-12);
        // c after a_b sees b as its predecessor
        assert!((lm.word_prob(c, &[ab]) - log_of(0.5)).abs() < 1e-12);
    }

    #[test]
    fn dynamic_model_follows_state() {
        let vocab = Vocab::new();
        let a = vocab.add_word("a");
        let v = vocab.clone();
        let loader: ModelLoader<'_> = Box::new(move |state: &str| -> Result<Box<dyn LanguageModel>> {
            match state {
                "null" => Ok(Box::new(NullLm::new(v.clone()))),
                "ordered" => Ok(Box::new(Ordered { vocab: v.clone() })),
                other => Err(LmError::Config(format!("no model '{}'", other))),
            }
        });
        let lm = DynamicLm::new(vocab, loader);
        assert_eq!(lm.word_prob(a, &[]), LOGP_ONE);
        assert!(lm.set_state("ordered"));
        assert!((lm.word_prob(a, &[]) - log_of(0.25)).abs() < 1e-12);
        assert!(!lm.set_state("missing"));
        assert_eq!(lm.state().as_deref(), Some("ordered"));
        assert!(lm.set_state("null"));
        assert_eq!(lm.word_prob(a, &[]), LOGP_ONE);
        assert_ne!(lm.word_prob(a, &[]), LOGP_ZERO);
    }
}
