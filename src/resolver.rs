// 🧭 Data Source Resolver
// Category → datasets, as a static total mapping

use crate::dataset::DatasetKind;
use crate::question::Category;
use std::collections::BTreeSet;

/// Datasets a category reads. Pure; every category has an entry.
pub fn resolve(category: Category) -> BTreeSet<DatasetKind> {
    let kinds: &[DatasetKind] = match category {
        Category::PayableMax
        | Category::ReceivableMax
        | Category::InvoiceMax
        | Category::TotalAmount
        | Category::AverageAmount
        | Category::ByProviderMax
        | Category::MonthWithMostInvoices
        | Category::TotalByTypeAndMonth
        | Category::PaymentTermsByProvider => &[DatasetKind::Invoices],
        Category::FixedExpenses => &[DatasetKind::FixedExpenses],
        Category::CashFlow => &[DatasetKind::BankStatement],
        Category::General => &DatasetKind::ALL,
    };
    kinds.iter().copied().collect()
}

/// Categories that tolerate some of their datasets being unavailable
pub fn is_best_effort(category: Category) -> bool {
    matches!(category, Category::General)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_category_resolves_to_something() {
        for category in Category::ALL {
            assert!(!resolve(category).is_empty(), "{} has no datasets", category);
        }
    }

    #[test]
    fn test_resolve_is_deterministic() {
        for category in Category::ALL {
            assert_eq!(resolve(category), resolve(category));
        }
    }

    #[test]
    fn test_single_dataset_categories() {
        assert_eq!(
            resolve(Category::PayableMax).into_iter().collect::<Vec<_>>(),
            vec![DatasetKind::Invoices]
        );
        assert_eq!(
            resolve(Category::FixedExpenses).into_iter().collect::<Vec<_>>(),
            vec![DatasetKind::FixedExpenses]
        );
        assert_eq!(
            resolve(Category::CashFlow).into_iter().collect::<Vec<_>>(),
            vec![DatasetKind::BankStatement]
        );
    }

    #[test]
    fn test_general_reads_everything() {
        assert_eq!(resolve(Category::General).len(), 3);
        assert!(is_best_effort(Category::General));
        assert!(!is_best_effort(Category::CashFlow));
    }
}
